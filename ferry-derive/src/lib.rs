//! Derive macro for ferry's `SharedMemorySafe` marker trait.
//!
//! The trait is `unsafe` because most of its contract (concurrent access
//! through atomics, no reliance on `Drop`) cannot be machine-checked. What
//! *can* be checked at compile time, this macro checks:
//!
//! 1. the type carries a stable representation (`#[repr(C)]`,
//!    `#[repr(transparent)]`, or a primitive repr for enums),
//! 2. no field type mentions pointers, references, heap owners (`Vec`,
//!    `Box`, `String`, ...) or process-local sync primitives (`Mutex`,
//!    `Condvar`, ...) anywhere in its generic arguments,
//! 3. every field type itself implements `SharedMemorySafe`, enforced with
//!    generated `where` bounds.
//!
//! ```
//! use ferry::SharedMemorySafe;
//! use std::sync::atomic::AtomicUsize;
//!
//! #[derive(SharedMemorySafe)]
//! #[repr(C)]
//! struct Counters {
//!     hits: AtomicUsize,
//!     scratch: [u8; 64],
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro_crate::{crate_name, FoundCrate};
use quote::quote;
use syn::{
    parse_macro_input, spanned::Spanned, Data, DeriveInput, Error, Fields, GenericArgument,
    PathArguments, ReturnType, Type,
};

/// Derives `SharedMemorySafe` after validating repr and field types.
///
/// See the crate-level docs for the checks performed. The generated impl is
/// `unsafe impl SharedMemorySafe` with a `where` bound per field type, so a
/// field whose type does not implement the trait fails to compile even when
/// the syntactic checks cannot see the problem.
#[proc_macro_derive(SharedMemorySafe)]
pub fn derive_shared_memory_safe(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn expand(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    require_stable_repr(&input)?;

    let field_types = field_types(&input.data)?;
    for ty in &field_types {
        reject_pointer_carriers(ty)?;
    }

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let krate = crate_path();

    let mut predicates = where_clause
        .map(|w| w.predicates.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    for ty in &field_types {
        predicates.push(syn::parse_quote!(#ty: #krate::__SharedMemorySafePrivate));
    }

    Ok(if predicates.is_empty() {
        quote! {
            unsafe impl #impl_generics #krate::__SharedMemorySafePrivate for #name #ty_generics {}
        }
    } else {
        quote! {
            unsafe impl #impl_generics #krate::__SharedMemorySafePrivate for #name #ty_generics
            where #(#predicates),*
            {}
        }
    })
}

/// Resolves the path to the ferry crate, handling renames and use from
/// within ferry itself (which declares `extern crate self as ferry`).
fn crate_path() -> proc_macro2::TokenStream {
    match crate_name("ferry") {
        Ok(FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
        Ok(FoundCrate::Itself) | Err(_) => quote!(::ferry),
    }
}

fn is_stable_repr_ident(ident: &syn::Ident) -> bool {
    const STABLE: &[&str] = &[
        "C", "transparent", "u8", "u16", "u32", "u64", "u128", "usize", "i8", "i16", "i32", "i64",
        "i128", "isize",
    ];
    STABLE.iter().any(|name| ident == name)
}

fn require_stable_repr(input: &DeriveInput) -> syn::Result<()> {
    let mut found = false;
    for attr in &input.attrs {
        if !attr.path().is_ident("repr") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if let Some(ident) = meta.path.get_ident() {
                if is_stable_repr_ident(ident) {
                    found = true;
                }
            }
            Ok(())
        })?;
    }
    if found {
        return Ok(());
    }

    let help = if matches!(input.data, Data::Enum(_)) {
        "SharedMemorySafe needs a stable layout: add #[repr(C)] or a primitive repr like #[repr(u8)]"
    } else {
        "SharedMemorySafe needs a stable layout: add #[repr(C)] or #[repr(transparent)]"
    };
    Err(Error::new(input.span(), help))
}

fn field_types(data: &Data) -> syn::Result<Vec<Type>> {
    fn of_fields(fields: &Fields) -> Vec<Type> {
        match fields {
            Fields::Named(f) => f.named.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unnamed(f) => f.unnamed.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unit => Vec::new(),
        }
    }

    match data {
        Data::Struct(s) => Ok(of_fields(&s.fields)),
        Data::Enum(e) => Ok(e
            .variants
            .iter()
            .flat_map(|v| of_fields(&v.fields))
            .collect()),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "SharedMemorySafe cannot be derived for unions",
        )),
    }
}

/// Why a named type can never live in shared memory.
fn forbidden_reason(ident: &syn::Ident) -> Option<&'static str> {
    const HEAP: &[&str] = &["Vec", "Box", "String", "PathBuf", "OsString", "CString"];
    const COUNTED: &[&str] = &["Rc", "Arc"];
    const PROCESS_LOCAL: &[&str] = &["Mutex", "RwLock", "Condvar", "Barrier", "Once"];

    if HEAP.iter().any(|n| ident == n) {
        Some("owns heap memory; virtual addresses do not cross process boundaries")
    } else if COUNTED.iter().any(|n| ident == n) {
        Some("is reference-counted through a pointer; use inline data instead")
    } else if PROCESS_LOCAL.iter().any(|n| ident == n) {
        Some("is a process-local sync primitive; use atomics for cross-process state")
    } else {
        None
    }
}

/// Walks a field type (including generic arguments) and rejects anything
/// that syntactically carries a pointer.
fn reject_pointer_carriers(field_ty: &Type) -> syn::Result<()> {
    fn walk(ty: &Type, field_ty: &Type) -> syn::Result<()> {
        match ty {
            Type::Path(path) => {
                for segment in &path.path.segments {
                    if let Some(reason) = forbidden_reason(&segment.ident) {
                        return Err(Error::new(
                            segment.ident.span(),
                            format!(
                                "field type `{}`: `{}` {}",
                                quote!(#field_ty),
                                segment.ident,
                                reason,
                            ),
                        ));
                    }
                    match &segment.arguments {
                        PathArguments::AngleBracketed(args) => {
                            for arg in &args.args {
                                if let GenericArgument::Type(inner) = arg {
                                    walk(inner, field_ty)?;
                                }
                            }
                        }
                        PathArguments::Parenthesized(args) => {
                            for input in &args.inputs {
                                walk(input, field_ty)?;
                            }
                            if let ReturnType::Type(_, ret) = &args.output {
                                walk(ret, field_ty)?;
                            }
                        }
                        PathArguments::None => {}
                    }
                }
                Ok(())
            }
            Type::Reference(r) => Err(Error::new(
                r.span(),
                format!(
                    "field type `{}` contains a reference; addresses are process-specific",
                    quote!(#field_ty),
                ),
            )),
            Type::Ptr(p) => Err(Error::new(
                p.span(),
                format!(
                    "field type `{}` contains a raw pointer; addresses are process-specific",
                    quote!(#field_ty),
                ),
            )),
            Type::Tuple(t) => t.elems.iter().try_for_each(|e| walk(e, field_ty)),
            Type::Array(a) => walk(&a.elem, field_ty),
            Type::Slice(s) => walk(&s.elem, field_ty),
            Type::Group(g) => walk(&g.elem, field_ty),
            Type::Paren(p) => walk(&p.elem, field_ty),
            // Remaining variants either cannot appear as field types or
            // carry no nested types worth inspecting.
            _ => Ok(()),
        }
    }

    walk(field_ty, field_ty)
}
