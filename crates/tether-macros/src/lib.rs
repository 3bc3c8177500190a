//! Procedural macros for the Tether meta-object system.
//!
//! `#[derive(Object)]` generates, for a struct:
//!
//! - a `static` [`MetaObject`] with the method, property and class-info
//!   tables, reachable as `Type::META`;
//! - the single invocation seam routing every reflective call
//!   (read/write/reset property, invoke, create, lookup, argument type
//!   registration) to the struct's fields and methods;
//! - one emitter method per declared signal;
//! - the `Object` trait implementation.
//!
//! [`MetaObject`]: https://docs.rs/tether-core/latest/tether_core/meta/struct.MetaObject.html
//!
//! # Attributes
//!
//! ## `#[object(...)]` on the struct
//!
//! ```ignore
//! #[derive(Object, Default)]
//! #[object(
//!     signal = "value_changed(i32)",
//!     slot = "set_value(i32)",
//!     method = "value() -> i32",
//!     class_info(author = "tether", version = "1"),
//!     event = "on_event",
//! )]
//! struct Counter {
//!     #[property(notify = "value_changed", reset)]
//!     value: Property<i32>,
//! }
//! ```
//!
//! - `signal = "name(T, ...)"`: declares a signal and generates
//!   `fn name(&self, ctx: &Context, a0: &T, ...)` that emits it.
//! - `slot = "name(T, ...)"` / `method = "name(T, ...) -> R"`: declares an
//!   invokable member backed by a user-written
//!   `fn name(&self, ctx: &Context, a0: &T, ...) -> R`.
//! - `class_info(key = "value", ...)`: class annotations.
//! - `event = "handler"`: routes `Object::event` to
//!   `fn handler(&self, ctx: &Context, event: &mut Event) -> bool`.
//! - `class_name = "Name"`: overrides the reflected class name.
//! - `no_factory`: omits the default-constructing constructor. Without it
//!   the struct must implement `Default`.
//!
//! ## `#[property(...)]` on a field
//!
//! The field must be a `Property<T>`, or any `Clone` type when `read_only`.
//!
//! - `notify = "signal"`: emitted by the generated setter when the value
//!   changes, with the new value if the signal takes one argument.
//! - `reset` restores `T::default()`; `reset = "method"` calls
//!   `fn method(&self, ctx: &Context)` instead.
//! - `read_only`: no write access.
//!
//! ## `#[object(superclass)]` on a field
//!
//! Marks an embedded object whose class becomes the superclass. Its members
//! are reachable through the derived type's meta-object.
//!
//! Signal and slot parameter types must be `Clone + Send + Sync + 'static`
//! so that queued connections can copy them.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    Attribute, Data, DeriveInput, Fields, Ident, LitStr, Token, Type, parse_macro_input,
    spanned::Spanned,
};

/// Derive the `Object` trait and generate meta-object information.
#[proc_macro_derive(Object, attributes(object, property))]
pub fn derive_object(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match impl_derive_object(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MemberKind {
    Signal,
    Slot,
    Method,
}

/// A parsed `name(T1, T2) -> R` declaration.
struct MemberInfo {
    kind: MemberKind,
    name: Ident,
    params: Vec<Type>,
    ret: Option<Type>,
}

enum Reset {
    Default,
    Method(Ident),
}

struct PropertyInfo {
    field_name: Ident,
    inner_type: Type,
    is_property_wrapper: bool,
    notify_signal: Option<LitStr>,
    reset: Option<Reset>,
    read_only: bool,
}

struct ObjectAttrs {
    members: Vec<MemberInfo>,
    class_info: Vec<(String, LitStr)>,
    event_handler: Option<Ident>,
    class_name: Option<LitStr>,
    no_factory: bool,
}

struct Superclass {
    field_name: Ident,
    field_type: Type,
}

fn impl_derive_object(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = &input.ident;
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "Object derive does not support generic structs",
        ));
    }

    let fields: Vec<&syn::Field> = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => fields.named.iter().collect(),
            Fields::Unit => Vec::new(),
            Fields::Unnamed(_) => {
                return Err(syn::Error::new_spanned(
                    input,
                    "Object derive only supports structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                input,
                "Object derive only supports structs",
            ));
        }
    };

    let attrs = parse_object_attrs(&input.attrs)?;

    let mut properties = Vec::new();
    let mut superclass = None;
    for field in fields {
        if is_superclass_field(&field.attrs)? {
            if superclass.is_some() {
                return Err(syn::Error::new_spanned(field, "only one superclass field is allowed"));
            }
            let field_name = field.ident.clone().ok_or_else(|| syn::Error::new(field.span(), "expected a named field"))?;
            superclass = Some(Superclass {
                field_name,
                field_type: field.ty.clone(),
            });
        }
        if let Some(property) = parse_property_field(field)? {
            properties.push(property);
        }
    }

    let class_name = attrs
        .class_name
        .as_ref()
        .map(LitStr::value)
        .unwrap_or_else(|| struct_name.to_string());

    let method_table = generate_method_table(&attrs);
    let property_table = generate_property_table(&attrs, &properties)?;
    let class_info_table = generate_class_info_table(&attrs);
    let static_call = generate_static_call(struct_name, &class_name, &attrs, &properties)?;
    let emitters = generate_emitters(&attrs);

    let superclass_meta = match &superclass {
        Some(s) => {
            let ty = &s.field_type;
            quote! { ::core::option::Option::Some(<#ty>::META) }
        }
        None => quote! { ::core::option::Option::Some(&::tether_core::meta::OBJECT_META) },
    };
    let upcast = match &superclass {
        Some(s) => {
            let field = &s.field_name;
            quote! {
                fn __upcast(instance: &dyn ::core::any::Any) -> ::core::option::Option<&dyn ::core::any::Any> {
                    instance
                        .downcast_ref::<#struct_name>()
                        .map(|this| &this.#field as &dyn ::core::any::Any)
                }
            }
        }
        None => quote! {},
    };
    let upcast_field = if superclass.is_some() {
        quote! { ::core::option::Option::Some(__upcast) }
    } else {
        quote! { ::core::option::Option::None }
    };

    let event_impl = match &attrs.event_handler {
        Some(handler) => quote! {
            fn event(
                &self,
                ctx: &::tether_core::meta::Context,
                event: &mut ::tether_core::Event,
            ) -> bool {
                self.#handler(ctx, event)
            }
        },
        None => quote! {},
    };

    let method_count = attrs.members.len() + usize::from(!attrs.no_factory);
    let property_count = properties.len();
    let class_info_count = attrs.class_info.len();

    Ok(quote! {
        const _: () = {
            static __METHODS: [::tether_core::meta::MethodDescriptor; #method_count] = #method_table;
            static __PROPERTIES: [::tether_core::meta::PropertyDescriptor; #property_count] = #property_table;
            static __CLASS_INFO: [::tether_core::meta::ClassInfo; #class_info_count] = #class_info_table;

            #upcast

            #static_call

            static __META: ::tether_core::meta::MetaObject = ::tether_core::meta::MetaObject {
                class_name: #class_name,
                superclass: #superclass_meta,
                methods: &__METHODS,
                properties: &__PROPERTIES,
                enums: &[],
                class_info: &__CLASS_INFO,
                static_call: ::core::option::Option::Some(__static_call),
                upcast: #upcast_field,
            };

            impl #struct_name {
                /// The static meta-object of this type.
                pub const META: &'static ::tether_core::meta::MetaObject = &__META;

                #emitters
            }

            impl ::tether_core::Object for #struct_name {
                fn meta_object(&self) -> &'static ::tether_core::meta::MetaObject {
                    &__META
                }

                #event_impl
            }
        };
    })
}

fn parse_object_attrs(attrs: &[Attribute]) -> syn::Result<ObjectAttrs> {
    let mut result = ObjectAttrs {
        members: Vec::new(),
        class_info: Vec::new(),
        event_handler: None,
        class_name: None,
        no_factory: false,
    };

    for attr in attrs {
        if !attr.path().is_ident("object") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            let kind = if meta.path.is_ident("signal") {
                Some(MemberKind::Signal)
            } else if meta.path.is_ident("slot") {
                Some(MemberKind::Slot)
            } else if meta.path.is_ident("method") {
                Some(MemberKind::Method)
            } else {
                None
            };
            if let Some(kind) = kind {
                let decl: LitStr = meta.value()?.parse()?;
                let member = parse_member(kind, &decl)?;
                if kind == MemberKind::Signal && member.ret.is_some() {
                    return Err(syn::Error::new_spanned(&decl, "signals cannot return a value"));
                }
                result.members.push(member);
            } else if meta.path.is_ident("class_info") {
                meta.parse_nested_meta(|entry| {
                    let key = entry
                        .path
                        .get_ident()
                        .ok_or_else(|| entry.error("expected a plain key"))?
                        .to_string();
                    let value: LitStr = entry.value()?.parse()?;
                    result.class_info.push((key, value));
                    Ok(())
                })?;
            } else if meta.path.is_ident("event") {
                let handler: LitStr = meta.value()?.parse()?;
                result.event_handler = Some(handler.parse()?);
            } else if meta.path.is_ident("class_name") {
                result.class_name = Some(meta.value()?.parse()?);
            } else if meta.path.is_ident("no_factory") {
                result.no_factory = true;
            } else {
                return Err(meta.error("unsupported object attribute"));
            }
            Ok(())
        })?;
    }

    Ok(result)
}

/// Parse `name(T1, T2)` or `name(T1) -> R`.
fn parse_member(kind: MemberKind, decl: &LitStr) -> syn::Result<MemberInfo> {
    let text = decl.value();
    let err = |msg: &str| syn::Error::new_spanned(decl, msg);

    let (signature, ret) = match text.rsplit_once("->") {
        Some((sig, ret)) => (sig.trim(), Some(ret.trim())),
        None => (text.trim(), None),
    };
    let open = signature.find('(').ok_or_else(|| err("expected `name(params)`"))?;
    if !signature.ends_with(')') {
        return Err(err("expected `name(params)`"));
    }
    let name: Ident = syn::parse_str(signature[..open].trim())
        .map_err(|_| err("invalid member name"))?;
    let params = split_params(&signature[open + 1..signature.len() - 1])
        .into_iter()
        .map(|p| syn::parse_str::<Type>(&p).map_err(|_| err(&format!("invalid parameter type `{p}`"))))
        .collect::<syn::Result<Vec<_>>>()?;
    let ret = match ret {
        Some(r) if !r.is_empty() => {
            Some(syn::parse_str::<Type>(r).map_err(|_| err("invalid return type"))?)
        }
        Some(_) => return Err(err("missing return type")),
        None => None,
    };

    Ok(MemberInfo {
        kind,
        name,
        params,
        ret,
    })
}

/// Split on commas outside angle brackets, parentheses and square brackets.
fn split_params(params: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in params.chars() {
        match c {
            '<' | '(' | '[' => depth += 1,
            '>' | ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                out.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    out.push(current);
    out.into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn is_superclass_field(attrs: &[Attribute]) -> syn::Result<bool> {
    let mut found = false;
    for attr in attrs {
        if !attr.path().is_ident("object") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("superclass") {
                found = true;
                Ok(())
            } else {
                Err(meta.error("unsupported field attribute; expected `superclass`"))
            }
        })?;
    }
    Ok(found)
}

fn parse_property_field(field: &syn::Field) -> syn::Result<Option<PropertyInfo>> {
    let Some(attr) = field.attrs.iter().find(|a| a.path().is_ident("property")) else {
        return Ok(None);
    };
    let field_name = field
        .ident
        .clone()
        .ok_or_else(|| syn::Error::new(field.span(), "expected a named field"))?;

    let mut notify_signal = None;
    let mut reset = None;
    let mut read_only = false;

    if !matches!(attr.meta, syn::Meta::Path(_)) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("notify") {
                notify_signal = Some(meta.value()?.parse::<LitStr>()?);
            } else if meta.path.is_ident("reset") {
                if meta.input.peek(Token![=]) {
                    let method: LitStr = meta.value()?.parse()?;
                    reset = Some(Reset::Method(method.parse()?));
                } else {
                    reset = Some(Reset::Default);
                }
            } else if meta.path.is_ident("read_only") {
                read_only = true;
            } else {
                return Err(meta.error("unsupported property attribute"));
            }
            Ok(())
        })?;
    }

    let (inner_type, is_property_wrapper) = extract_inner_type(&field.ty);
    if !is_property_wrapper && !read_only {
        return Err(syn::Error::new_spanned(
            &field.ty,
            "writable properties must be `Property<T>` fields",
        ));
    }
    if !is_property_wrapper && matches!(reset, Some(Reset::Default)) {
        return Err(syn::Error::new_spanned(
            &field.ty,
            "`reset` without a method requires a `Property<T>` field",
        ));
    }

    Ok(Some(PropertyInfo {
        field_name,
        inner_type,
        is_property_wrapper,
        notify_signal,
        reset,
        read_only,
    }))
}

/// Extract the inner type from `Property<T>`, or return the original type.
fn extract_inner_type(ty: &Type) -> (Type, bool) {
    if let Type::Path(type_path) = ty {
        if let Some(segment) = type_path.path.segments.last() {
            if segment.ident == "Property" {
                if let syn::PathArguments::AngleBracketed(args) = &segment.arguments {
                    if let Some(syn::GenericArgument::Type(inner)) = args.args.first() {
                        return (inner.clone(), true);
                    }
                }
            }
        }
    }
    (ty.clone(), false)
}

/// Convert a type to its compact string form.
fn type_to_string(ty: &Type) -> String {
    quote!(#ty).to_string().replace(' ', "")
}

fn generate_method_table(attrs: &ObjectAttrs) -> TokenStream2 {
    let mut entries: Vec<TokenStream2> = attrs
        .members
        .iter()
        .map(|member| {
            let name = member.name.to_string();
            let params: Vec<String> = member.params.iter().map(type_to_string).collect();
            let ctor = match member.kind {
                MemberKind::Signal => quote!(signal),
                MemberKind::Slot => quote!(slot),
                MemberKind::Method => quote!(method),
            };
            let returning = member.ret.as_ref().map(|r| {
                let r = type_to_string(r);
                quote! { .returning(#r) }
            });
            quote! {
                ::tether_core::meta::MethodDescriptor::#ctor(#name, &[#(#params),*]) #returning
            }
        })
        .collect();
    if !attrs.no_factory {
        entries.push(quote! { ::tether_core::meta::MethodDescriptor::constructor(&[]) });
    }
    quote! { [#(#entries),*] }
}

fn signal_local(attrs: &ObjectAttrs, name: &LitStr) -> syn::Result<usize> {
    attrs
        .members
        .iter()
        .position(|m| m.kind == MemberKind::Signal && m.name == name.value())
        .ok_or_else(|| syn::Error::new_spanned(name, "no signal with this name is declared"))
}

fn generate_property_table(attrs: &ObjectAttrs, properties: &[PropertyInfo]) -> syn::Result<TokenStream2> {
    let mut entries = Vec::new();
    for prop in properties {
        let name = prop.field_name.to_string();
        let type_name = type_to_string(&prop.inner_type);
        let mut entry = if prop.read_only {
            quote! { ::tether_core::meta::PropertyDescriptor::read_only(#name, #type_name) }
        } else {
            quote! { ::tether_core::meta::PropertyDescriptor::read_write(#name, #type_name) }
        };
        if let Some(signal) = &prop.notify_signal {
            let local = signal_local(attrs, signal)?;
            entry = quote! { #entry.with_notify(#local) };
        }
        if prop.reset.is_some() {
            entry = quote! { #entry.resettable() };
        }
        entries.push(entry);
    }
    Ok(quote! { [#(#entries),*] })
}

fn generate_class_info_table(attrs: &ObjectAttrs) -> TokenStream2 {
    let entries = attrs.class_info.iter().map(|(key, value)| {
        quote! { ::tether_core::meta::ClassInfo { name: #key, value: #value } }
    });
    quote! { [#(#entries),*] }
}

fn arg_idents(count: usize) -> Vec<Ident> {
    (0..count).map(|i| format_ident!("a{}", i)).collect()
}

fn generate_emitters(attrs: &ObjectAttrs) -> TokenStream2 {
    let emitters = attrs
        .members
        .iter()
        .enumerate()
        .filter(|(_, m)| m.kind == MemberKind::Signal)
        .map(|(local, member)| {
            let name = &member.name;
            let args = arg_idents(member.params.len());
            let types = &member.params;
            let count = member.params.len();
            let doc = format!("Emit the `{name}` signal from the object `ctx` refers to.");
            quote! {
                #[doc = #doc]
                #[allow(clippy::too_many_arguments)]
                pub fn #name(&self, ctx: &::tether_core::meta::Context, #(#args: &#types),*) {
                    let slots: [::tether_core::types::ArgRef<'_>; #count] = [#(#args),*];
                    ctx.emit(__META.method_offset() + #local, &slots);
                }
            }
        });
    quote! { #(#emitters)* }
}

fn generate_static_call(
    struct_name: &Ident,
    class_name: &str,
    attrs: &ObjectAttrs,
    properties: &[PropertyInfo],
) -> syn::Result<TokenStream2> {
    let this = quote! {
        instance
            .and_then(|i| i.downcast_ref::<#struct_name>())
            .ok_or(::tether_core::meta::MetaError::InstanceMismatch(#class_name))?
    };

    // InvokeMethod
    let invoke_arms = attrs.members.iter().enumerate().map(|(local, member)| {
        if member.kind == MemberKind::Signal {
            return quote! {
                #local => {
                    let ctx = args.context()?;
                    ctx.emit(__META.method_offset() + #local, args.slots());
                    Ok(())
                }
            };
        }
        let name = &member.name;
        let idents = arg_idents(member.params.len());
        let fetch = member.params.iter().zip(&idents).enumerate().map(|(pos, (ty, ident))| {
            quote! { let #ident = args.arg::<#ty>(#pos)?; }
        });
        let call = quote! { this.#name(ctx, #(#idents),*) };
        let body = if member.ret.is_some() {
            quote! {
                let ret = #call;
                args.set_return(ret);
            }
        } else {
            quote! { #call; }
        };
        quote! {
            #local => {
                let this = #this;
                let ctx = args.context()?;
                #(#fetch)*
                #body
                Ok(())
            }
        }
    });

    // Property access
    let mut read_arms = Vec::new();
    let mut write_arms = Vec::new();
    let mut reset_arms = Vec::new();
    for (local, prop) in properties.iter().enumerate() {
        let field = &prop.field_name;
        let ty = &prop.inner_type;
        let read = if prop.is_property_wrapper {
            quote! { this.#field.get() }
        } else {
            quote! { ::core::clone::Clone::clone(&this.#field) }
        };
        read_arms.push(quote! {
            #local => {
                let this = #this;
                args.set_return::<#ty>(#read);
                Ok(())
            }
        });

        let notify = match &prop.notify_signal {
            Some(signal) => {
                let signal_index = signal_local(attrs, signal)?;
                let takes_value = attrs.members[signal_index].params.len() == 1;
                if takes_value {
                    quote! {
                        let value: #ty = this.#field.get();
                        ctx.emit(__META.method_offset() + #signal_index, &[&value]);
                    }
                } else {
                    quote! { ctx.emit(__META.method_offset() + #signal_index, &[]); }
                }
            }
            None => quote! {},
        };

        if !prop.read_only {
            write_arms.push(quote! {
                #local => {
                    let this = #this;
                    let ctx = args.context()?;
                    let value = ::core::clone::Clone::clone(args.arg::<#ty>(0)?);
                    if this.#field.set(value) {
                        #notify
                    }
                    let _ = ctx;
                    Ok(())
                }
            });
        }

        match &prop.reset {
            Some(Reset::Default) => reset_arms.push(quote! {
                #local => {
                    let this = #this;
                    let ctx = args.context()?;
                    if this.#field.reset() {
                        #notify
                    }
                    let _ = ctx;
                    Ok(())
                }
            }),
            Some(Reset::Method(method)) => reset_arms.push(quote! {
                #local => {
                    let this = #this;
                    let ctx = args.context()?;
                    this.#method(ctx);
                    Ok(())
                }
            }),
            None => {}
        }
    }

    // CreateInstance
    let create_arm = if attrs.no_factory {
        quote! {}
    } else {
        let local = attrs.members.len();
        quote! {
            #local => {
                args.set_return(::tether_core::NewObject::new(
                    <#struct_name as ::core::default::Default>::default(),
                ));
                Ok(())
            }
        }
    };

    // RegisterArgumentType
    let register_arms = attrs.members.iter().enumerate().flat_map(|(local, member)| {
        member.params.iter().enumerate().map(move |(pos, ty)| {
            let name = type_to_string(ty);
            quote! { (#local, #pos) => types.register::<#ty>(#name), }
        })
    });

    Ok(quote! {
        #[allow(unused_variables, unreachable_code, clippy::match_single_binding)]
        fn __static_call(
            instance: ::core::option::Option<&dyn ::core::any::Any>,
            call: ::tether_core::meta::MetaCall,
            local: usize,
            args: &mut ::tether_core::meta::MetaArgs<'_>,
        ) -> ::tether_core::meta::MetaResult<()> {
            use ::tether_core::meta::{MetaCall, MetaError};
            match call {
                MetaCall::InvokeMethod => match local {
                    #(#invoke_arms)*
                    _ => Err(MetaError::Unsupported(call)),
                },
                MetaCall::ReadProperty => match local {
                    #(#read_arms)*
                    _ => Err(MetaError::Unsupported(call)),
                },
                MetaCall::WriteProperty => match local {
                    #(#write_arms)*
                    _ => Err(MetaError::Unsupported(call)),
                },
                MetaCall::ResetProperty => match local {
                    #(#reset_arms)*
                    _ => Err(MetaError::Unsupported(call)),
                },
                MetaCall::CreateInstance => match local {
                    #create_arm
                    _ => Err(MetaError::NotCreatable(#class_name)),
                },
                MetaCall::IndexOfMethod => {
                    let name = args.arg::<::std::string::String>(0)?;
                    if let ::core::option::Option::Some(index) =
                        __METHODS.iter().position(|m| m.name == name.as_str())
                    {
                        args.set_return(index);
                    }
                    Ok(())
                }
                MetaCall::RegisterArgumentType => {
                    let types = args.types()?;
                    let position = *args.arg::<usize>(0)?;
                    let id = match (local, position) {
                        #(#register_arms)*
                        _ => ::tether_core::types::MetaTypeId::INVALID,
                    };
                    args.set_return(id);
                    Ok(())
                }
            }
        }
    })
}
