//! Before/after instrumentation registry keyed by a fixed enumeration of
//! hook points. Each hook receives a context struct carrying
//! whatever subset of correlation id, task id, messages, response, tool
//! name/input/output, or error applies to the firing point — the rest are
//! `None`.

use std::collections::HashMap;
use std::sync::Arc;

use aigent_llm::{ChatMessage, ChatResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeLLMCall,
    AfterLLMCall,
    BeforeToolExec,
    AfterToolExec,
    OnError,
}

#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub correlation_id: String,
    pub task_id: String,
    pub messages: Option<Vec<ChatMessage>>,
    pub response: Option<ChatResponse>,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_output: Option<String>,
    pub error: Option<String>,
}

pub type Hook = Arc<dyn Fn(&HookContext) + Send + Sync>;

#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<HookPoint, Vec<Hook>>,
}

impl HookRegistry {
    pub fn register(&mut self, point: HookPoint, hook: Hook) {
        self.hooks.entry(point).or_default().push(hook);
    }

    /// Fires every hook registered at `point`, in registration order.
    pub fn fire(&self, point: HookPoint, ctx: &HookContext) {
        if let Some(hooks) = self.hooks.get(&point) {
            for hook in hooks {
                hook(ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fire_with_no_hooks_registered_is_a_no_op() {
        let registry = HookRegistry::default();
        registry.fire(HookPoint::BeforeLLMCall, &HookContext::default());
    }

    #[test]
    fn fire_invokes_registered_hooks_in_order() {
        let mut registry = HookRegistry::default();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        registry.register(HookPoint::BeforeToolExec, Arc::new(move |_| o1.lock().unwrap().push(1)));
        registry.register(HookPoint::BeforeToolExec, Arc::new(move |_| o2.lock().unwrap().push(2)));

        registry.fire(HookPoint::BeforeToolExec, &HookContext::default());
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn fire_does_not_trigger_hooks_registered_on_other_points() {
        let mut registry = HookRegistry::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        registry.register(HookPoint::OnError, Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));

        registry.fire(HookPoint::BeforeLLMCall, &HookContext::default());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn context_carries_tool_fields() {
        let ctx = HookContext {
            task_id: "t1".into(),
            tool_name: Some("read_file".into()),
            tool_input: Some("{}".into()),
            ..Default::default()
        };
        assert_eq!(ctx.tool_name.as_deref(), Some("read_file"));
        assert!(ctx.response.is_none());
    }
}
