use proc_macro::TokenStream;

use quote::quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Declares a pipeline task.
///
/// Generates an `ID` constant, a `plan` function that adds the
/// task to a `crate::planner::Plan`, and an `exec` function that forwards to
/// the struct's own `fn run(req: &InstallRequest, ctx: &mut ExecCtx) -> Result<()>`.
///
/// Keys: `id`, `module`, `phase`, `label` (required), `provides`, `after`
/// (string arrays), `when` (path to `fn(&InstallRequest) -> bool`; the task is
/// only planned when it returns true).
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    match task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// Groups tasks into a module implementing `crate::modules::Module` and
/// `crate::executor::ModuleExec`.
///
/// Keys: `id`, `tasks` (array of task struct paths), optional `when`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match module_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn expr_array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    let mut out = Vec::new();
    for e in elems {
        out.push(lit_str(e)?);
    }
    Ok(out)
}

fn expr_path(expr: &Expr) -> syn::Result<syn::Path> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(path.clone()),
        _ => Err(syn::Error::new(expr.span(), "expected path (identifier)")),
    }
}

fn expr_array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    let mut out = Vec::new();
    for e in elems {
        out.push(expr_path(e)?);
    }
    Ok(out)
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            let Some(ident) = p.get_ident() else {
                return true;
            };
            ident != "Task" && ident != "Module"
        })
        .cloned()
        .collect()
}

fn parse_key_values(attr: TokenStream) -> syn::Result<Vec<(String, Expr, proc_macro2::Span)>> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;
    let mut out = Vec::new();
    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        out.push((key, nv.value, nv.path.span()));
    }
    Ok(out)
}

struct TaskMeta {
    id: String,
    module: String,
    phase: String,
    label: String,
    provides: Vec<String>,
    after: Vec<String>,
    when: Option<syn::Path>,
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut module: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut label: Option<String> = None;
    let mut provides: Vec<String> = Vec::new();
    let mut after: Vec<String> = Vec::new();
    let mut when: Option<syn::Path> = None;

    for (key, v, span) in parse_key_values(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "module" => module = Some(lit_str(&v)?),
            "phase" => phase = Some(lit_str(&v)?),
            "label" => label = Some(lit_str(&v)?),
            "provides" => provides = expr_array_strings(&v)?,
            "after" => after = expr_array_strings(&v)?,
            "when" => when = Some(expr_path(&v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Task attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing id"))?;
    let module =
        module.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing module"))?;
    if !id.starts_with(&format!("{module}.")) {
        return Err(syn::Error::new(
            struct_ident.span(),
            "Task: id must start with '<module>.'",
        ));
    }

    let meta = TaskMeta {
        id,
        module,
        phase: phase.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing phase"))?,
        label: label.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing label"))?,
        provides,
        after,
        when,
    };

    let id_lit = meta.id;
    let module_lit = meta.module;
    let phase_lit = meta.phase;
    let label_lit = meta.label;
    let provides_lits = meta.provides;
    let after_lits = meta.after;

    let when_check = match meta.when {
        Some(pred) => quote! {
            if !#pred(req) {
                return Ok(());
            }
        },
        None => quote! {
            let _ = req;
        },
    };

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id_lit;

            pub fn plan(
                req: &crate::request::InstallRequest,
                plan: &mut crate::planner::Plan,
            ) -> crate::Result<()> {
                #when_check

                plan.add(crate::planner::Task {
                    id: #id_lit.to_string(),
                    label: #label_lit.to_string(),
                    module: #module_lit.to_string(),
                    phase: #phase_lit.to_string(),
                    after: vec![#(#after_lits.to_string()),*],
                    provides: vec![#(#provides_lits.to_string()),*],
                })?;
                Ok(())
            }

            pub fn exec(
                req: &crate::request::InstallRequest,
                ctx: &mut crate::executor::ExecCtx,
            ) -> crate::Result<()> {
                if ctx.dry_run {
                    ctx.log(&format!("DRY-RUN: exec {}", #id_lit));
                    return Ok(());
                }

                // Tasks define their runtime behavior by implementing:
                // `fn run(req: &InstallRequest, ctx: &mut ExecCtx) -> crate::Result<()>`
                Self::run(req, ctx)
            }
        }
    };

    Ok(expanded.into())
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut tasks: Option<Vec<syn::Path>> = None;
    let mut when: Option<syn::Path> = None;

    for (key, v, span) in parse_key_values(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "tasks" => tasks = Some(expr_array_paths(&v)?),
            "when" => when = Some(expr_path(&v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Module attribute key '{other}'"),
                ));
            }
        }
    }

    let id_lit = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing id"))?;
    let tasks =
        tasks.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing tasks"))?;

    let detect_body = match when {
        Some(pred) => quote! { #pred(req) },
        None => quote! {
            let _ = req;
            true
        },
    };

    let call_tasks = tasks.iter().map(|p| quote! { #p::plan(req, plan)?; });
    let reg_tasks = tasks.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::modules::Module for #struct_ident {
            fn id(&self) -> &'static str {
                #id_lit
            }

            fn detect(&self, req: &crate::request::InstallRequest) -> bool {
                #detect_body
            }

            fn plan(
                &self,
                req: &crate::request::InstallRequest,
                plan: &mut crate::planner::Plan,
            ) -> crate::Result<()> {
                #(#call_tasks)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #struct_ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#reg_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
