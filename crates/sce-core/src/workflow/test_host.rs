//! In-test durable host with scripted responses.
//!
//! Timers complete immediately and are recorded, signal waits with a timeout
//! resolve to `None` unless a signal is already buffered, and activities
//! answer from a script. Nothing here reads the wall clock except `now`,
//! which advances a fixed clock by one millisecond per call.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};

use sce_types::ids::InstanceId;

use super::host::{ActivityCall, ChildWorkflowCall, DurableHost, HostError, HostFuture};

/// Scripted answer for an activity.
#[derive(Debug, Clone)]
pub enum Script {
    Reply(Result<Value, String>),
    /// Never completes; used to exercise cancellation.
    Hang,
}

#[derive(Default)]
struct State {
    clock_ms: i64,
    activity_calls: Vec<ActivityCall>,
    child_calls: Vec<ChildWorkflowCall>,
    sleeps: Vec<Duration>,
    signal_timeouts: Vec<Duration>,
    mailboxes: HashMap<(InstanceId, String), VecDeque<Value>>,
}

pub struct ScriptedHost {
    activities: HashMap<String, Script>,
    child_result: Result<Value, String>,
    state: Mutex<State>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self {
            activities: HashMap::new(),
            child_result: Ok(json!({})),
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_activity(mut self, name: &str, reply: Result<Value, String>) -> Self {
        self.activities.insert(name.to_string(), Script::Reply(reply));
        self
    }

    pub fn with_hanging_activity(mut self, name: &str) -> Self {
        self.activities.insert(name.to_string(), Script::Hang);
        self
    }

    pub fn with_child_result(mut self, result: Result<Value, String>) -> Self {
        self.child_result = result;
        self
    }

    pub fn activity_calls(&self) -> Vec<ActivityCall> {
        self.state.lock().unwrap().activity_calls.clone()
    }

    pub fn activity_names(&self) -> Vec<String> {
        self.activity_calls().into_iter().map(|c| c.name).collect()
    }

    pub fn child_calls(&self) -> Vec<ChildWorkflowCall> {
        self.state.lock().unwrap().child_calls.clone()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().unwrap().sleeps.clone()
    }

    pub fn signal_timeouts(&self) -> Vec<Duration> {
        self.state.lock().unwrap().signal_timeouts.clone()
    }
}

impl DurableHost for ScriptedHost {
    fn now(&self) -> DateTime<Utc> {
        let mut state = self.state.lock().unwrap();
        state.clock_ms += 1;
        Utc.timestamp_millis_opt(1_700_000_000_000 + state.clock_ms).unwrap()
    }

    fn execute_activity<'a>(&'a self, call: ActivityCall) -> HostFuture<'a, Value> {
        let name = call.name.clone();
        self.state.lock().unwrap().activity_calls.push(call);
        let script = self
            .activities
            .get(&name)
            .cloned()
            .unwrap_or(Script::Reply(Ok(json!({}))));
        Box::pin(async move {
            match script {
                Script::Reply(Ok(value)) => Ok(value),
                Script::Reply(Err(message)) => Err(HostError::ActivityFailed {
                    name,
                    attempts: 1,
                    message,
                }),
                Script::Hang => std::future::pending().await,
            }
        })
    }

    fn sleep<'a>(&'a self, duration: Duration) -> HostFuture<'a, ()> {
        self.state.lock().unwrap().sleeps.push(duration);
        Box::pin(async { Ok(()) })
    }

    fn wait_signal<'a>(
        &'a self,
        instance_id: InstanceId,
        name: &'a str,
        timeout: Option<Duration>,
    ) -> HostFuture<'a, Option<Value>> {
        let buffered = {
            let mut state = self.state.lock().unwrap();
            if let Some(t) = timeout {
                state.signal_timeouts.push(t);
            }
            state
                .mailboxes
                .get_mut(&(instance_id, name.to_string()))
                .and_then(VecDeque::pop_front)
        };
        Box::pin(async move {
            match (buffered, timeout) {
                (Some(value), _) => Ok(Some(value)),
                (None, Some(_)) => Ok(None),
                (None, None) => std::future::pending().await,
            }
        })
    }

    fn deliver_signal(&self, instance_id: InstanceId, name: &str, payload: Value) -> Result<(), HostError> {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .entry((instance_id, name.to_string()))
            .or_default()
            .push_back(payload);
        Ok(())
    }

    fn start_child_workflow<'a>(&'a self, call: ChildWorkflowCall) -> HostFuture<'a, Value> {
        let name = call.workflow_name.clone();
        self.state.lock().unwrap().child_calls.push(call);
        let result = self.child_result.clone();
        Box::pin(async move {
            result.map_err(|message| HostError::ActivityFailed {
                name,
                attempts: 1,
                message,
            })
        })
    }
}
