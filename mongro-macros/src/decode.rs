use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::*;

use crate::attr::{FieldAttrs, is_option};

macro_rules! error {
    ($($tt:tt)*) => {
        return Err(syn::Error::new(proc_macro::Span::call_site().into(), format!($($tt)*)))
    };
}

pub fn decode(input: DeriveInput) -> Result<TokenStream> {
    let DeriveInput { attrs: _, vis: _, ident, generics, data } = input;
    let Data::Struct(data) = data else {
        error!("only struct are currently supported")
    };
    let Fields::Named(FieldsNamed { named, .. }) = data.fields else {
        error!("only named fields are currently supported")
    };

    let mut head = quote! {};
    let mut arms = quote! {};
    let mut build = quote! {};

    for field in &named {
        let attrs = FieldAttrs::parse(&field.attrs)?;
        let id = field.ident.as_ref().unwrap();

        if attrs.skip {
            build.extend(quote! { #id: ::std::default::Default::default(), });
            continue;
        }

        if attrs.inline {
            build.extend(quote! {
                #id: ::mongro::bson::Decode::decode(
                    ::mongro::bson::ValueReader::document(raw.clone()),
                )?,
            });
            continue;
        }

        let key = attrs.key(field);
        let slot = format_ident!("f_{id}");
        head.extend(quote! { let mut #slot = ::std::option::Option::None; });

        let read = if attrs.truncate {
            quote! { ::mongro::bson::decode::DecodeTruncated::decode_truncated(value)? }
        } else {
            quote! { ::mongro::bson::Decode::decode(value)? }
        };
        arms.extend(quote! {
            #key => #slot = ::std::option::Option::Some(#read),
        });

        if is_option(field) {
            build.extend(quote! {
                #id: match #slot {
                    ::std::option::Option::Some(v) => v,
                    ::std::option::Option::None => ::std::option::Option::None,
                },
            });
        } else {
            build.extend(quote! {
                #id: match #slot {
                    ::std::option::Option::Some(v) => v,
                    ::std::option::Option::None => ::mongro::bson::decode::missing(#key)?,
                },
            });
        }
    }

    let (g1, g2, g3) = generics.split_for_impl();

    Ok(quote! {
        impl #g1 ::mongro::bson::Decode for #ident #g2 #g3 {
            fn decode(
                r: ::mongro::bson::ValueReader,
            ) -> ::std::result::Result<Self, ::mongro::bson::ValueError> {
                let raw = r.read_raw_document()?;
                let mut reader = ::mongro::bson::DocumentReader::new(raw.clone())?;
                #head
                while let ::std::option::Option::Some(entry) = reader.next() {
                    let (key, value) = entry?;
                    match key.as_str() {
                        #arms
                        _ => value.skip(),
                    }
                }
                Ok(Self { #build })
            }
        }
    }.into())
}
