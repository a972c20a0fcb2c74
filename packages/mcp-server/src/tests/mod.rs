


#[cfg(test)]
pub mod test_helpers {
    use crate::context::ToolContext;
    use crate::tools::{tools_call, CallToolRequest};
    use sandkeep_sandbox::testing::{sample_entry, MockEngine};
    use sandkeep_sandbox::{LanguageConfig, NetworkPolicy, Registry, SandboxService, SandboxSettings};
    use serde_json::Value;
    use std::sync::Arc;

    /// A context backed by the in-memory engine with an isolated and a bridged entry
    pub fn create_test_context() -> (ToolContext, Arc<MockEngine>) {
        let registry = Registry::from_entries(vec![
            sample_entry("python-small", NetworkPolicy::None),
            sample_entry("python-web", NetworkPolicy::Bridge),
        ])
        .unwrap();
        create_context_with(registry)
    }

    pub fn create_context_with(registry: Registry) -> (ToolContext, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::new());
        let service = SandboxService::with_engine(
            SandboxSettings::default(),
            registry,
            LanguageConfig::builtin().unwrap(),
            engine.clone(),
        );
        (ToolContext::new(Arc::new(service)), engine)
    }

    /// Call a tool and return (payload, is_error)
    pub async fn call(context: &ToolContext, name: &str, arguments: Value) -> (Value, bool) {
        let result = tools_call(
            Some(CallToolRequest {
                name: name.to_string(),
                arguments: Some(arguments),
            }),
            context,
        )
        .await
        .unwrap();
        assert_eq!(result.content.len(), 1);
        let payload: Value = serde_json::from_str(&result.content[0].text).unwrap();
        (payload, result.is_error == Some(true))
    }
}
