use std::sync::Arc;

use npuop::attr::AttrValue;
use npuop::driver::HostDriver;
use npuop::prelude::*;

#[derive(OpAttrs)]
struct GenMask {
    seed: i32,
    #[attr(name = "seed2")]
    offset: i32,
    #[attr(skip)]
    #[allow(dead_code)]
    label: &'static str,
}

#[derive(OpAttrs)]
struct Scale {
    value: f32,
}

#[derive(OpAttrs)]
struct NoAttrs;

#[derive(OpAttrs)]
struct Mixed {
    axes: Vec<i64>,
    keep_dims: bool,
    mode: String,
}

#[test]
fn test_rename_and_skip() {
    let map = GenMask { seed: 1, offset: 2, label: "ignored" }.into_attribute_map();
    assert_eq!(map.len(), 2);
    assert_eq!(map["seed"], AttrValue::Int(1));
    assert_eq!(map["seed2"], AttrValue::Int(2));
}

#[test]
fn test_variants_follow_field_types() {
    let map = Mixed {
        axes: vec![0, 2],
        keep_dims: true,
        mode: "sum".into(),
    }
    .into_attribute_map();
    assert_eq!(map["axes"], AttrValue::Int64s(vec![0, 2]));
    assert_eq!(map["keep_dims"], AttrValue::Bool(true));
    assert_eq!(map["mode"], AttrValue::String("sum".into()));
    assert!(NoAttrs.into_attribute_map().is_empty());
}

#[test]
fn test_derived_attrs_reach_the_driver() {
    let driver = Arc::new(HostDriver::default());
    let dev = Npu::new(driver.clone());
    let x = dev.tensor_from_vec(vec![1.0f32, 2.0], &[2]).unwrap();
    let y = dev.alloc(DType::Float32, &[2]).unwrap();

    let runner = OpRunner::with_io(&dev, "Muls", &[x], &[y.clone()], Scale { value: 0.5 }).unwrap();
    let stored = driver.op_attrs(runner.attr().unwrap()).unwrap();
    assert_eq!(stored["value"], AttrValue::Float(0.5));
    runner.run(Some(dev.stream()), false).unwrap();
    assert_eq!(dev.to_vec::<f32>(&y).unwrap(), [0.5, 1.0]);
}
