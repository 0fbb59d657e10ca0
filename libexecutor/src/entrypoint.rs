use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use crate::context::ExecutionContext;

/// An in-process pack entrypoint: `(context, args) → result`.
pub type EntrypointFn = Arc<
    dyn Fn(
            ExecutionContext,
            serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>
        + Send
        + Sync,
>;

/// Registration table for packs granted the main-thread capability.
/// Entrypoints are located by `(pack name, entrypoint name)`; the entrypoint
/// name defaults to `default`.
#[derive(Default)]
pub struct EntrypointRegistry {
    inner: RwLock<HashMap<String, EntrypointFn>>,
}

fn table_key(pack_name: &str, entrypoint: &str) -> String {
    format!("{pack_name}/{entrypoint}")
}

impl EntrypointRegistry {
    pub fn new() -> Self {
        EntrypointRegistry::default()
    }

    pub fn register<F, Fut>(&self, pack_name: &str, entrypoint: &str, f: F)
    where
        F: Fn(ExecutionContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        let wrapped: EntrypointFn = Arc::new(move |ctx, args| Box::pin(f(ctx, args)));
        self.inner
            .write()
            .unwrap()
            .insert(table_key(pack_name, entrypoint), wrapped);
    }

    pub fn lookup(&self, pack_name: &str, entrypoint: &str) -> Option<EntrypointFn> {
        self.inner
            .read()
            .unwrap()
            .get(&table_key(pack_name, entrypoint))
            .cloned()
    }
}
