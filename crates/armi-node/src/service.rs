//! Service registry entries -- declarative method tables.
//!
//! A service is a named table of typed handlers. Resolution is by method
//! name and argument count: the exact-arity entry wins, otherwise a variadic
//! entry accepting at least that many arguments. This replaces runtime
//! reflection with an explicit descriptor built at registration time.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use armi_protocol::{Value, WireError};

/// Boxed future returned by a method handler.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value, WireError>> + Send>>;

type MethodHandler = Box<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

enum Arity {
    Exact(usize),
    AtLeast(usize),
}

struct MethodEntry {
    arity: Arity,
    handler: MethodHandler,
}

/// A named set of invocable methods. Built once, registered on the hub,
/// shared immutably afterwards.
#[derive(Default)]
pub struct ServiceDescriptor {
    methods: HashMap<String, Vec<MethodEntry>>,
}

impl ServiceDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a synchronous method with a fixed argument count. The same name
    /// may be added more than once with different arities.
    pub fn method(
        self,
        name: &str,
        arity: usize,
        f: impl Fn(Vec<Value>) -> Result<Value, WireError> + Send + Sync + 'static,
    ) -> Self {
        self.push(name, Arity::Exact(arity), wrap_sync(f))
    }

    /// Add an async method with a fixed argument count.
    pub fn async_method(
        self,
        name: &str,
        arity: usize,
        f: impl Fn(Vec<Value>) -> MethodFuture + Send + Sync + 'static,
    ) -> Self {
        self.push(name, Arity::Exact(arity), Box::new(f))
    }

    /// Add a synchronous variadic method taking `min_arity` or more
    /// arguments. Only consulted when no exact-arity entry matches.
    pub fn variadic_method(
        self,
        name: &str,
        min_arity: usize,
        f: impl Fn(Vec<Value>) -> Result<Value, WireError> + Send + Sync + 'static,
    ) -> Self {
        self.push(name, Arity::AtLeast(min_arity), wrap_sync(f))
    }

    fn push(mut self, name: &str, arity: Arity, handler: MethodHandler) -> Self {
        self.methods
            .entry(name.to_owned())
            .or_default()
            .push(MethodEntry { arity, handler });
        self
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve the method and produce its invocation future, without running
    /// it. The caller awaits the future outside any registry lock.
    pub(crate) fn prepare(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<MethodFuture, WireError> {
        let entries = self.methods.get(method).ok_or_else(|| {
            WireError::here(format!("Method not found: {service}.{method}"))
        })?;
        let exact = entries
            .iter()
            .find(|e| matches!(e.arity, Arity::Exact(n) if n == args.len()));
        let entry = match exact {
            Some(e) => e,
            None => entries
                .iter()
                .find(|e| matches!(e.arity, Arity::AtLeast(n) if args.len() >= n))
                .ok_or_else(|| {
                    WireError::here(format!(
                        "Method not found: {service}.{method} taking {} argument(s)",
                        args.len()
                    ))
                })?,
        };
        Ok((entry.handler)(args))
    }
}

fn wrap_sync(
    f: impl Fn(Vec<Value>) -> Result<Value, WireError> + Send + Sync + 'static,
) -> MethodHandler {
    // Deferred into the future so a panicking handler unwinds inside the
    // invocation worker, where it becomes an error response.
    let f = std::sync::Arc::new(f);
    Box::new(move |args| {
        let f = f.clone();
        Box::pin(async move { f(args) })
    })
}

/// Helper for handlers: the i-th argument as a string, or an invocation
/// error naming the position.
pub fn string_arg(args: &[Value], i: usize) -> Result<&str, WireError> {
    args.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::here(format!("argument {i} must be a string")))
}
