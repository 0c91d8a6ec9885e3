use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use quill_core::error::{QuillError, Result};
use quill_core::function::{FunctionInfo, QuillFunction};
use quill_core::step::StepContext;

/// Type-erased function body: event data in, serialized output out.
pub type BoxedFunctionHandler =
    Arc<dyn for<'a> Fn(&'a StepContext, Value) -> BoxFuture<'a, Result<Value>> + Send + Sync>;

/// A registered function.
pub struct FunctionEntry {
    pub info: FunctionInfo,
    pub handler: BoxedFunctionHandler,
    validate: fn(&Value) -> Result<()>,
}

impl FunctionEntry {
    /// Check that event data deserializes into the function's input.
    pub fn validate_input(&self, data: &Value) -> Result<()> {
        (self.validate)(data)
    }
}

fn boxed_handler<H>(handler: H) -> BoxedFunctionHandler
where
    H: for<'a> Fn(&'a StepContext, Value) -> BoxFuture<'a, Result<Value>> + Send + Sync + 'static,
{
    Arc::new(handler)
}

fn parse_input<T: DeserializeOwned>(data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| QuillError::Validation(format!("invalid input: {e}")))
}

fn check_input<T: DeserializeOwned>(data: &Value) -> Result<()> {
    parse_input::<T>(data.clone()).map(|_| ())
}

/// Functions known to this process, keyed by id.
///
/// Built once at boot and shared behind an `Arc`; nothing is registered after
/// the engine starts.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Arc<FunctionEntry>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. Ids must be unique.
    pub fn register<F>(&mut self, function: F) -> Result<()>
    where
        F: QuillFunction,
        F::Input: 'static,
        F::Output: 'static,
    {
        let info = function.info();
        if self.functions.contains_key(info.id) {
            return Err(QuillError::DuplicateFunctionId(info.id.to_string()));
        }

        let function = Arc::new(function);
        let handler = boxed_handler(move |ctx, data| {
            let function = function.clone();
            Box::pin(async move {
                let input = parse_input::<F::Input>(data)?;
                let output = function.execute(ctx, input).await?;
                Ok(serde_json::to_value(output)?)
            })
        });

        tracing::debug!(function_id = info.id, trigger = %info.trigger, "Registered function");
        self.functions.insert(
            info.id.to_string(),
            Arc::new(FunctionEntry {
                info,
                handler,
                validate: check_input::<F::Input>,
            }),
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<FunctionEntry>> {
        self.functions.get(id).cloned()
    }

    /// Every function triggered by the event name, ordered by id.
    pub fn matching(&self, event_name: &str) -> Vec<Arc<FunctionEntry>> {
        self.functions
            .values()
            .filter(|entry| entry.info.trigger.matches(event_name))
            .cloned()
            .collect()
    }

    /// All registered functions, ordered by id.
    pub fn list(&self) -> impl Iterator<Item = &FunctionInfo> {
        self.functions.values().map(|entry| &entry.info)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
