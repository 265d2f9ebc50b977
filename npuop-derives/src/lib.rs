use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::spanned::Spanned;
use syn::{parse_macro_input, Data, DeriveInput, Fields, LitStr};

/// Implements `npuop::attr::IntoAttributeMap` for a struct with named fields, so a plain
/// struct can be handed to `OpRunner::add_attrs` or `OpRunner::with_io`.
///
/// Every field becomes one attribute keyed by the field name, converted with
/// `AttrValue::from`. Two field attributes change that:
/// 1. `#[attr(name = "...")]` uses a different key.
/// 2. `#[attr(skip)]` leaves the field out.
///
/// ```ignore
/// #[derive(npuop::OpAttrs)]
/// struct GenMaskAttrs {
///     seed: i32,
///     #[attr(name = "seed2")]
///     second_seed: i32,
///     #[attr(skip)]
///     note: &'static str,
/// }
/// ```
#[proc_macro_derive(OpAttrs, attributes(attr))]
pub fn op_attrs(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

struct FieldAttr {
    name: Option<String>,
    skip: bool,
}

fn parse_field_attr(field: &syn::Field) -> syn::Result<FieldAttr> {
    let mut parsed = FieldAttr {
        name: None,
        skip: false,
    };
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("attr")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                parsed.skip = true;
                Ok(())
            } else if meta.path.is_ident("name") {
                let name: LitStr = meta.value()?.parse()?;
                parsed.name = Some(name.value());
                Ok(())
            } else {
                Err(meta.error("expected `name = \"...\"` or `skip`"))
            }
        })?;
    }
    Ok(parsed)
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream> {
    let name = &input.ident;
    let fields = match &input.data {
        Data::Struct(obj) => match &obj.fields {
            Fields::Named(fields) => &fields.named,
            Fields::Unit => {
                return Ok(impl_block(input, quote!()));
            }
            Fields::Unnamed(_) => {
                return Err(syn::Error::new(
                    name.span(),
                    "OpAttrs needs named fields to name the attributes",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new(
                name.span(),
                "OpAttrs can only be derived for structs",
            ))
        }
    };

    let mut inserts = Vec::new();
    for field in fields {
        let attr = parse_field_attr(field)?;
        if attr.skip {
            continue;
        }
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        let key = attr.name.unwrap_or_else(|| ident.to_string());
        inserts.push(quote_spanned! {field.span()=>
            map.insert(
                ::std::string::String::from(#key),
                ::npuop::attr::AttrValue::from(self.#ident),
            );
        });
    }
    Ok(impl_block(input, quote!(#(#inserts)*)))
}

fn impl_block(input: &DeriveInput, inserts: TokenStream) -> TokenStream {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    quote! {
        impl #impl_generics ::npuop::attr::IntoAttributeMap for #name #ty_generics #where_clause {
            #[allow(unused_mut)]
            fn into_attribute_map(self) -> ::npuop::attr::AttributeMap {
                let mut map = ::npuop::attr::AttributeMap::new();
                #inserts
                map
            }
        }
    }
}
