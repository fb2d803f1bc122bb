//! Server-side method table.
//!
//! Methods are registered once, before the server starts serving, and the
//! table only grows. Registering a name that is already present is ignored,
//! so the first registration of a name always wins. The reserved `batch`
//! entry is always present and is described separately from the methods it
//! runs (see [`crate::batch`]).

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use crate::batch;
use crate::descriptor::{MethodDescriptor, MethodSignature, Param, RegistryDescription};
use crate::errors::{MethodError, MethodResult};
use crate::protocol::JsonMap;

pub const BATCH_METHOD: &str = "batch";

#[async_trait]
pub trait ServerMethod: Send + Sync {
    fn signature(&self) -> MethodSignature;
    async fn invoke(&self, call: MethodCall) -> MethodResult;
}

struct FnMethod<F, Fut> {
    signature: MethodSignature,
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> ServerMethod for FnMethod<F, Fut>
where
    F: Fn(MethodCall) -> Fut + Send + Sync,
    Fut: Future<Output = MethodResult> + Send,
{
    fn signature(&self) -> MethodSignature {
        self.signature.clone()
    }

    async fn invoke(&self, call: MethodCall) -> MethodResult {
        (self.func)(call).await
    }
}

struct RegisteredMethod {
    handler: Arc<dyn ServerMethod>,
    signature: MethodSignature,
    descriptor: MethodDescriptor,
}

pub struct MethodRegistry {
    methods: IndexMap<String, RegisteredMethod>,
    batch: MethodDescriptor,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            methods: IndexMap::new(),
            batch: MethodDescriptor::from_signature(BATCH_METHOD, &batch::signature()),
        }
    }

    /// Adds `handler` under `name`. Returns `false`, leaving the table
    /// untouched, when the name is already taken.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ServerMethod>) -> bool {
        let name = name.into();
        if name == BATCH_METHOD || self.methods.contains_key(&name) {
            tracing::debug!(method = %name, "ignoring duplicate server method registration");
            return false;
        }
        let signature = handler.signature();
        let descriptor = MethodDescriptor::from_signature(name.clone(), &signature);
        self.methods.insert(
            name,
            RegisteredMethod {
                handler,
                signature,
                descriptor,
            },
        );
        true
    }

    /// Registers an async closure as a server method.
    pub fn register_fn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        signature: MethodSignature,
        func: F,
    ) -> bool
    where
        F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.register(
            name,
            Arc::new(FnMethod {
                signature,
                func,
                _marker: PhantomData,
            }),
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        name == BATCH_METHOD || self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }

    pub fn describe_all(&self) -> RegistryDescription {
        let mut description = RegistryDescription::new();
        for method in self.methods.values() {
            description.push(method.descriptor.clone());
        }
        description.push(self.batch.clone());
        description
    }

    /// Resolves `name` and runs it. `None` means the name does not resolve.
    pub async fn invoke(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: JsonMap,
    ) -> Option<MethodResult> {
        if name == BATCH_METHOD {
            return Some(batch::run(self, args, kwargs).await);
        }
        self.invoke_method(name, args, kwargs).await
    }

    /// Like [`MethodRegistry::invoke`] but never resolves the reserved
    /// `batch` entry.
    pub async fn invoke_method(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: JsonMap,
    ) -> Option<MethodResult> {
        let method = self.methods.get(name)?;
        let call = match MethodCall::bind(name, &method.signature, args, kwargs) {
            Ok(call) => call,
            Err(err) => return Some(Err(err)),
        };
        Some(method.handler.invoke(call).await)
    }
}

/// Arguments of one invocation, bound to parameter names.
#[derive(Clone, Debug)]
pub struct MethodCall {
    method: String,
    values: IndexMap<String, Value>,
}

impl MethodCall {
    pub fn bind(
        method: &str,
        signature: &MethodSignature,
        args: Vec<Value>,
        mut kwargs: JsonMap,
    ) -> Result<Self, MethodError> {
        let params: Vec<&Param> = signature.params().collect();
        if args.len() > params.len() {
            return Err(MethodError::type_error(format!(
                "{method}() takes {} positional arguments but {} were given",
                params.len(),
                args.len()
            )));
        }

        let mut values = IndexMap::new();
        let positional = args.len();
        for (param, value) in params.iter().zip(args) {
            values.insert(param.name().to_string(), value);
        }
        for param in params.iter().skip(positional) {
            if let Some(value) = kwargs.remove(param.name()) {
                values.insert(param.name().to_string(), value);
            } else if let Some(default) = param.default() {
                values.insert(param.name().to_string(), default.clone());
            } else {
                return Err(MethodError::type_error(format!(
                    "{method}() missing required argument: '{}'",
                    param.name()
                )));
            }
        }
        if let Some(name) = kwargs.keys().next() {
            let message = if values.contains_key(name) {
                format!("{method}() got multiple values for argument '{name}'")
            } else {
                format!("{method}() got an unexpected keyword argument '{name}'")
            };
            return Err(MethodError::type_error(message));
        }

        Ok(Self {
            method: method.to_string(),
            values,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    fn require(&self, name: &str) -> Result<&Value, MethodError> {
        self.get(name).ok_or_else(|| {
            MethodError::type_error(format!("{}() has no parameter '{name}'", self.method))
        })
    }

    fn wrong_type(&self, name: &str, expected: &str, found: &Value) -> MethodError {
        MethodError::type_error(format!(
            "{}() argument '{name}' must be {expected}, not {found}",
            self.method
        ))
    }

    pub fn str(&self, name: &str) -> Result<&str, MethodError> {
        let value = self.require(name)?;
        value
            .as_str()
            .ok_or_else(|| self.wrong_type(name, "a string", value))
    }

    pub fn f64(&self, name: &str) -> Result<f64, MethodError> {
        let value = self.require(name)?;
        value
            .as_f64()
            .ok_or_else(|| self.wrong_type(name, "a number", value))
    }

    pub fn u64(&self, name: &str) -> Result<u64, MethodError> {
        let value = self.require(name)?;
        value
            .as_u64()
            .ok_or_else(|| self.wrong_type(name, "a non-negative integer", value))
    }

    pub fn bool(&self, name: &str) -> Result<bool, MethodError> {
        let value = self.require(name)?;
        value
            .as_bool()
            .ok_or_else(|| self.wrong_type(name, "a boolean", value))
    }

    pub fn array(&self, name: &str) -> Result<&Vec<Value>, MethodError> {
        let value = self.require(name)?;
        value
            .as_array()
            .ok_or_else(|| self.wrong_type(name, "a list", value))
    }
}
