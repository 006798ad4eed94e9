use proc_macro::TokenStream;
use quote::quote;
use syn::*;

use crate::attr::FieldAttrs;

macro_rules! error {
    ($($tt:tt)*) => {
        return Err(syn::Error::new(proc_macro::Span::call_site().into(), format!($($tt)*)))
    };
}

pub fn encode(input: DeriveInput) -> Result<TokenStream> {
    let DeriveInput { attrs: _, vis: _, ident, generics, data } = input;
    let Data::Struct(data) = data else {
        error!("only struct are currently supported")
    };
    let Fields::Named(FieldsNamed { named, .. }) = data.fields else {
        error!("only named fields are currently supported")
    };

    let mut track = quote! {};
    let mut fields = quote! {};

    for field in &named {
        let attrs = FieldAttrs::parse(&field.attrs)?;
        if attrs.skip {
            continue;
        }

        let id = field.ident.as_ref().unwrap();

        if attrs.inline {
            track = quote! { doc.track_keys(); };
            fields.extend(quote! {
                ::mongro::bson::encode::EncodeFields::encode_fields(&self.#id, doc)?;
            });
            continue;
        }

        let key = attrs.key(field);
        let write = if attrs.min_size {
            quote! {
                ::mongro::bson::encode::EncodeMinSize::encode_min_size(&self.#id, doc.key(#key)?)?;
            }
        } else {
            quote! {
                ::mongro::bson::Encode::encode(&self.#id, doc.key(#key)?)?;
            }
        };

        if attrs.omit_empty {
            fields.extend(quote! {
                if !::mongro::bson::Encode::is_empty_value(&self.#id) {
                    #write
                }
            });
        } else {
            fields.extend(write);
        }
    }

    let (g1, g2, g3) = generics.split_for_impl();

    Ok(quote! {
        impl #g1 ::mongro::bson::Encode for #ident #g2 #g3 {
            fn encode(
                &self,
                w: ::mongro::bson::ValueWriter<'_>,
            ) -> ::std::result::Result<(), ::mongro::bson::ValueError> {
                let mut doc = w.put_document();
                #track
                ::mongro::bson::encode::EncodeFields::encode_fields(self, &mut doc)?;
                doc.close()
            }
        }

        impl #g1 ::mongro::bson::encode::EncodeFields for #ident #g2 #g3 {
            fn encode_fields(
                &self,
                doc: &mut ::mongro::bson::DocumentWriter<'_>,
            ) -> ::std::result::Result<(), ::mongro::bson::ValueError> {
                #fields
                Ok(())
            }
        }
    }.into())
}
