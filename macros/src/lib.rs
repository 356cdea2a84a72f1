//! `#[derive(Subject)]`: builds a type's [`subjective::metadata::TypeDescriptor`]
//! from its fields and implements `subjective::subject::Subject` for it.
//!
//! A field is declared `#[subjective(derived)]` or `#[subjective(state)]`;
//! state is the default when no attribute is present. A derived field may
//! also carry `settable` (`#[subjective(derived, settable)]`) for the rare
//! "derived with setter" pattern. The struct must have a field named `id`
//! of type `SubjectId` — that field backs `Subject::id`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

#[proc_macro_derive(Subject, attributes(subjective))]
pub fn derive_subject(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let type_name = input.ident.clone();
    let type_name_str = type_name.to_string();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => panic!("#[derive(Subject)] requires a struct with named fields"),
        },
        _ => panic!("#[derive(Subject)] only supports structs"),
    };

    let mut property_decls = Vec::new();
    let mut has_id_field = false;

    for field in fields {
        let field_ident = field.ident.as_ref().expect("named field");
        let field_name = field_ident.to_string();
        if field_name == "id" {
            has_id_field = true;
            continue;
        }
        let field_ty = &field.ty;
        let declared = FieldDeclaration::from_attrs(&field.attrs);
        let Some(declared) = declared else { continue };

        let name_str = field_name;
        let attribute_tokens: Vec<_> = declared
            .attributes
            .iter()
            .map(|a| match a {
                FieldAttribute::Derived => quote!(::subjective::Attribute::Derived),
                FieldAttribute::State => quote!(::subjective::Attribute::State),
            })
            .collect();
        let settable = declared.settable;

        property_decls.push(quote! {
            .property(::subjective::PropertyMetadata::new::<#field_ty>(
                #name_str,
                vec![#(#attribute_tokens),*],
                #settable,
            ))
        });
    }

    assert!(
        has_id_field,
        "#[derive(Subject)] requires a field named `id: SubjectId` on {}",
        type_name_str
    );

    let descriptor_static = quote::format_ident!("__{}_TYPE_DESCRIPTOR", type_name.to_string().to_uppercase());

    let expanded = quote! {
        static #descriptor_static: ::subjective::metadata::OnceDescriptor =
            ::subjective::metadata::OnceDescriptor::new();

        impl ::subjective::Subject for #type_name {
            fn id(&self) -> ::subjective::SubjectId {
                self.id
            }

            fn type_descriptor() -> &'static ::subjective::TypeDescriptor {
                #descriptor_static.get_or_init(|| {
                    ::subjective::TypeDescriptorBuilder::new(#type_name_str)
                        #(#property_decls)*
                        .build()
                })
            }
        }
    };

    expanded.into()
}

enum FieldAttribute {
    Derived,
    State,
}

struct FieldDeclaration {
    attributes: Vec<FieldAttribute>,
    settable: bool,
}

impl FieldDeclaration {
    fn from_attrs(attrs: &[syn::Attribute]) -> Option<Self> {
        let mut is_derived = false;
        let mut settable_override = None;

        for attr in attrs {
            if !attr.path.is_ident("subjective") {
                continue;
            }
            let meta = attr.parse_meta().expect("valid #[subjective(...)] attribute");
            let syn::Meta::List(list) = meta else {
                continue;
            };
            for nested in list.nested {
                if let syn::NestedMeta::Meta(syn::Meta::Path(path)) = nested {
                    if path.is_ident("derived") {
                        is_derived = true;
                        settable_override.get_or_insert(false);
                    } else if path.is_ident("state") {
                        is_derived = false;
                    } else if path.is_ident("settable") {
                        settable_override = Some(true);
                    }
                }
            }
        }

        Some(FieldDeclaration {
            attributes: vec![if is_derived { FieldAttribute::Derived } else { FieldAttribute::State }],
            settable: settable_override.unwrap_or(true),
        })
    }
}
