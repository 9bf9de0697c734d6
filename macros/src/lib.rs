//! Derive macros for scoped unit-of-work filters.
//!
//! Rust has no runtime reflection, so the members a registry may set on a
//! filter are described at compile time instead.
//!
//! # Available Macros
//!
//! - `#[derive(Injectable)]` - Generates the member table and setters used by
//!   property injection
//!
//! # Example
//!
//! ```ignore
//! use scoped_uow_core::Injectable;
//!
//! #[derive(Injectable, Default)]
//! struct AuditFilter {
//!     /// Writable: set from the registry when `AuditLog` is registered.
//!     pub audit: Option<AuditLog>,
//!
//!     /// Read-only: described, but never assigned.
//!     pub label: String,
//!
//!     /// Invisible to injection.
//!     #[inject(skip)]
//!     pub scratch: Option<String>,
//!
//!     /// Private fields are invisible as well.
//!     hits: u64,
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use proc_macro::TokenStream;
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Fields, GenericArgument, PathArguments, Type, Visibility,
    parse_macro_input,
};

/// Derive macro for injectable types.
///
/// Implements `scoped_uow_core::injection::Injectable`:
/// - `describe_members()` lists every `pub` named field in declaration order
/// - `pub` fields of type `Option<T>` are writable, with `T` as the service type
/// - other `pub` fields are described as read-only
/// - private fields and fields marked `#[inject(skip)]` are not described
/// - `assign_member()` downcasts the resolved component to `T` and stores a
///   clone in the field, so injected service types must be `Clone`
///   (typically `Arc<...>`)
///
/// # Attributes
///
/// - `#[inject(skip)]` - Hide a public field from injection
///
/// # Errors
///
/// Produces a compile error if applied to an enum, a union, or a tuple struct,
/// or if an unknown `#[inject(...)]` option is used.
#[proc_macro_derive(Injectable, attributes(inject))]
pub fn derive_injectable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let Data::Struct(data_struct) = &input.data else {
        return syn::Error::new_spanned(&input, "#[derive(Injectable)] can only be used on structs")
            .to_compile_error()
            .into();
    };

    let named: Vec<&syn::Field> = match &data_struct.fields {
        Fields::Named(fields) => fields.named.iter().collect(),
        Fields::Unit => Vec::new(),
        Fields::Unnamed(_) => {
            return syn::Error::new_spanned(
                &input,
                "#[derive(Injectable)] requires a struct with named fields",
            )
            .to_compile_error()
            .into();
        }
    };

    let mut descriptors = Vec::new();
    let mut assign_arms = Vec::new();

    for field in named {
        if !matches!(field.vis, Visibility::Public(_)) {
            continue;
        }

        match is_skipped(&field.attrs) {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => return err.to_compile_error().into(),
        }

        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        let member = ident.to_string();

        if let Some(service) = option_inner(&field.ty) {
            descriptors.push(quote! {
                ::scoped_uow_core::injection::MemberDescriptor::writable(
                    #member,
                    ::scoped_uow_core::registry::ServiceKey::of::<#service>(),
                )
            });
            assign_arms.push(quote! {
                #member => {
                    let value = value.downcast_ref::<#service>().cloned().ok_or(
                        ::scoped_uow_core::injection::AssignError::TypeMismatch {
                            member: #member,
                            expected: ::std::any::type_name::<#service>(),
                        },
                    )?;
                    self.#ident = ::std::option::Option::Some(value);
                    ::std::result::Result::Ok(())
                }
            });
        } else {
            let ty = &field.ty;
            descriptors.push(quote! {
                ::scoped_uow_core::injection::MemberDescriptor::read_only(
                    #member,
                    ::scoped_uow_core::registry::ServiceKey::of::<#ty>(),
                )
            });
            assign_arms.push(quote! {
                #member => ::std::result::Result::Err(
                    ::scoped_uow_core::injection::AssignError::ReadOnly { member: #member },
                ),
            });
        }
    }

    let expanded = quote! {
        impl #impl_generics ::scoped_uow_core::injection::Injectable for #name #ty_generics #where_clause {
            fn describe_members(&self) -> ::std::vec::Vec<::scoped_uow_core::injection::MemberDescriptor> {
                ::std::vec![#(#descriptors),*]
            }

            #[allow(unused_variables)]
            fn assign_member(
                &mut self,
                member: &str,
                value: ::scoped_uow_core::registry::Component,
            ) -> ::std::result::Result<(), ::scoped_uow_core::injection::AssignError> {
                match member {
                    #(#assign_arms)*
                    other => ::std::result::Result::Err(
                        ::scoped_uow_core::injection::AssignError::UnknownMember {
                            member: other.to_string(),
                        },
                    ),
                }
            }
        }
    };

    TokenStream::from(expanded)
}

/// Returns `T` when the type is spelled `Option<T>` (or a path ending in `Option<T>`).
fn option_inner(ty: &Type) -> Option<&Type> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    if segment.ident != "Option" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(inner) if args.args.len() == 1 => Some(inner),
        _ => None,
    }
}

/// Checks for `#[inject(skip)]`, rejecting unknown options.
fn is_skipped(attrs: &[Attribute]) -> syn::Result<bool> {
    let mut skip = false;
    for attr in attrs.iter().filter(|attr| attr.path().is_ident("inject")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("unsupported #[inject] option, expected `skip`"))
            }
        })?;
    }
    Ok(skip)
}
