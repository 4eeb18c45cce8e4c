//! Derive macro for conduit's `SharedMemorySafe` marker trait.
//!
//! Every type that ends up inside a conduit pool segment — queue payloads,
//! queue records, registry buckets — crosses a process boundary as raw bytes.
//! The derive verifies at compile time that a type is at least plausibly safe
//! for that: it has a stable layout and carries no process-local pointers.

use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::quote;
use syn::{
    Data, DeriveInput, Error, Fields, GenericArgument, Ident, PathArguments, Type, TypePath,
    parse_macro_input, spanned::Spanned,
};

/// Derives `SharedMemorySafe` after checking the type for shared-memory
/// hazards.
///
/// Two properties are enforced mechanically:
///
/// 1. The type has `#[repr(C)]`, `#[repr(transparent)]`, or an integer repr
///    for enums. Default Rust layout is not stable across compilations, and
///    the processes mapping a segment may not share a binary.
/// 2. No field names a pointer-carrying or process-local type (`Vec`, `Box`,
///    `String`, `Rc`, `Arc`, references, raw pointers, `std::sync` locks).
///    Virtual addresses mean nothing in the next process over.
///
/// Field types are additionally bound to `SharedMemorySafe` in a generated
/// `where` clause, so the check recurses through nested structs.
///
/// What cannot be checked — and remains the caller's responsibility — is
/// concurrent-access discipline: mutable shared state must go through
/// atomics, and nothing may rely on `Drop` running (a `SIGKILL`ed peer skips
/// destructors).
///
/// # Example
///
/// ```
/// # use conduit::SharedMemorySafe;
/// #[derive(SharedMemorySafe, Clone, Copy)]
/// #[repr(C)]
/// struct SensorSample {
///     source: u32,
///     sequence: u64,
///     reading: f64,
/// }
/// ```
///
/// # Rejections
///
/// ```compile_fail
/// # use conduit::SharedMemorySafe;
/// #[derive(SharedMemorySafe)]
/// struct NoRepr(u32); // missing #[repr(C)]
/// ```
///
/// ```compile_fail
/// # use conduit::SharedMemorySafe;
/// #[derive(SharedMemorySafe)]
/// #[repr(C)]
/// struct Heapy {
///     data: Vec<u8>, // heap pointer
/// }
/// ```
#[proc_macro_derive(SharedMemorySafe)]
pub fn derive_shared_memory_safe(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    check_repr(&input)?;

    let field_types = field_types(&input.data)?;
    for ty in &field_types {
        reject_pointer_types(ty)?;
    }

    let name = &input.ident;
    let krate = crate_path();
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let mut predicates = where_clause
        .map(|w| w.predicates.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    for ty in &field_types {
        predicates.push(syn::parse_quote!(#ty: #krate::__SharedMemorySafePrivate));
    }

    let expanded = if predicates.is_empty() {
        quote! {
            unsafe impl #impl_generics #krate::__SharedMemorySafePrivate for #name #ty_generics {}
        }
    } else {
        quote! {
            unsafe impl #impl_generics #krate::__SharedMemorySafePrivate for #name #ty_generics
            where #(#predicates),* {}
        }
    };

    Ok(expanded.into())
}

/// Resolves `conduit` even when the host crate renamed it (or is conduit
/// itself, via `extern crate self`).
fn crate_path() -> proc_macro2::TokenStream {
    match crate_name("conduit") {
        Ok(FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
        _ => quote!(::conduit),
    }
}

const STABLE_REPRS: &[&str] = &[
    "C", "transparent", "u8", "u16", "u32", "u64", "u128", "usize", "i8", "i16", "i32", "i64",
    "i128", "isize",
];

fn check_repr(input: &DeriveInput) -> syn::Result<()> {
    let mut stable = false;
    for attr in &input.attrs {
        if !attr.path().is_ident("repr") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if let Some(ident) = meta.path.get_ident()
                && STABLE_REPRS.iter().any(|r| ident == r)
            {
                stable = true;
            }
            Ok(())
        })?;
    }

    if !stable {
        return Err(Error::new(
            input.span(),
            "SharedMemorySafe requires a stable layout: add #[repr(C)], #[repr(transparent)], \
             or an integer repr for enums",
        ));
    }
    Ok(())
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
        Data::Enum(e) => Ok(e.variants.iter().flat_map(|v| of_fields(&v.fields)).collect()),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "SharedMemorySafe cannot be derived for unions",
        )),
    }
}

/// Walks a field type and rejects anything that smuggles a process-local
/// pointer, including through generic arguments (`Option<Vec<u8>>`).
fn reject_pointer_types(field_ty: &Type) -> syn::Result<()> {
    fn walk(ty: &Type, field_ty: &Type) -> syn::Result<()> {
        match ty {
            Type::Path(TypePath { path, .. }) => {
                for segment in &path.segments {
                    check_ident(&segment.ident, field_ty)?;
                    if let PathArguments::AngleBracketed(args) = &segment.arguments {
                        for arg in &args.args {
                            if let GenericArgument::Type(inner) = arg {
                                walk(inner, field_ty)?;
                            }
                        }
                    }
                }
            }
            Type::Reference(r) => {
                return Err(Error::new(
                    r.span(),
                    format!(
                        "field type `{}` contains a reference; addresses are process-local. \
                         Store inline data instead",
                        quote!(#field_ty),
                    ),
                ));
            }
            Type::Ptr(p) => {
                return Err(Error::new(
                    p.span(),
                    format!(
                        "field type `{}` contains a raw pointer; addresses are process-local. \
                         Store a pool offset instead",
                        quote!(#field_ty),
                    ),
                ));
            }
            Type::Tuple(t) => {
                for elem in &t.elems {
                    walk(elem, field_ty)?;
                }
            }
            Type::Array(a) => walk(&a.elem, field_ty)?,
            Type::Slice(s) => walk(&s.elem, field_ty)?,
            Type::Group(g) => walk(&g.elem, field_ty)?,
            Type::Paren(p) => walk(&p.elem, field_ty)?,
            _ => {}
        }
        Ok(())
    }

    walk(field_ty, field_ty)
}

const HEAP_TYPES: &[&str] = &["Vec", "Box", "String", "PathBuf", "OsString", "CString"];
const RC_TYPES: &[&str] = &["Rc", "Arc"];
const LOCK_TYPES: &[&str] = &["Mutex", "RwLock", "Condvar", "Barrier"];

fn check_ident(ident: &Ident, field_ty: &Type) -> syn::Result<()> {
    let complaint = if HEAP_TYPES.iter().any(|t| ident == t) {
        "owns a heap allocation"
    } else if RC_TYPES.iter().any(|t| ident == t) {
        "is reference-counted"
    } else if LOCK_TYPES.iter().any(|t| ident == t) {
        "is a process-local lock (use atomics, or conduit's shared-memory Mutex)"
    } else {
        return Ok(());
    };

    Err(Error::new(
        ident.span(),
        format!(
            "field type `{}` contains `{}`, which {} and cannot live in shared memory",
            quote!(#field_ty),
            ident,
            complaint,
        ),
    ))
}
