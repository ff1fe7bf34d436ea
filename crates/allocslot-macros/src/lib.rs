use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::ext::IdentExt;
use syn::{parse_macro_input, Ident, ItemFn};

/// Declares a function as the replacement for one entry-point slot.
///
/// The function is kept as written, and a `Replacement` constant named after
/// it in upper case is emitted next to it:
///
/// ```rust,ignore
/// #[allocslot::replace(ReleaseScalar)]
/// unsafe fn quiet_release(provider: &dyn RawMemoryProvider, call: &ReleaseCall) {
///     unsafe { provider.release(call.ptr, call.layout) }
/// }
///
/// table.install_replacement(&QUIET_RELEASE)?;
/// ```
#[proc_macro_attribute]
pub fn replace(attr: TokenStream, item: TokenStream) -> TokenStream {
    let slot = parse_macro_input!(attr as Ident);
    let input = parse_macro_input!(item as ItemFn);
    let vis = &input.vis;
    let fn_name = &input.sig.ident;

    let slot_name = slot.to_string();
    let handler = if slot_name.starts_with("Alloc") {
        quote! { ::allocslot::Handler::Allocate(#fn_name as ::allocslot::AllocateFn) }
    } else if slot_name.starts_with("Release") {
        quote! { ::allocslot::Handler::Release(#fn_name as ::allocslot::ReleaseFn) }
    } else {
        return syn::Error::new_spanned(
            &slot,
            "expected an EntryPointSlot variant such as AllocScalar or ReleaseArrayAligned",
        )
        .to_compile_error()
        .into();
    };

    let const_name = Ident::new(&fn_name.unraw().to_string().to_uppercase(), Span::call_site());

    let output = quote! {
        #input

        #[allow(dead_code)]
        #vis const #const_name: ::allocslot::Replacement = ::allocslot::Replacement::new(
            ::allocslot::EntryPointSlot::#slot,
            #handler,
        );
    };

    output.into()
}
