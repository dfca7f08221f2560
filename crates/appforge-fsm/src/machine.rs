//! State machine core - states as data, actors as trait objects

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub type MachineResult<T> = Result<T, MachineError>;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("unknown state: {0}")]
    UnknownState(String),

    #[error("machine not started")]
    NotStarted,

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] serde_json::Error),
}

/// Serialized snapshot sufficient to resume the machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineCheckpoint {
    pub stack_path: Vec<String>,
    pub context: serde_json::Value,
}

/// A unit of work invoked by a state. Reads the context, returns an
/// output that on_done actions fold back in; failures become error text,
/// never exceptions crossing the machine.
#[async_trait::async_trait]
pub trait StageActor<C, O>: Send + Sync {
    async fn execute(&self, ctx: &C) -> Result<O, String>;
}

/// Observer for state entries and checkpoint dumps. Emissions may
/// suspend; the machine awaits them, which is the back-pressure path.
#[async_trait::async_trait]
pub trait MachineObserver: Send + Sync {
    async fn on_enter(&self, state: &str);
    async fn on_checkpoint(&self, checkpoint: &MachineCheckpoint);
}

type Action<C, O> = Arc<dyn Fn(&mut C, &O) + Send + Sync>;
type ErrorAction<C> = Arc<dyn Fn(&mut C, &str) + Send + Sync>;

/// Transition taken when an invoke completes.
pub struct Transition<C, O> {
    pub target: String,
    pub actions: Vec<Action<C, O>>,
}

impl<C, O> Transition<C, O> {
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            actions: Vec::new(),
        }
    }

    pub fn action(mut self, action: impl Fn(&mut C, &O) + Send + Sync + 'static) -> Self {
        self.actions.push(Arc::new(action));
        self
    }
}

/// Transition taken when an invoke fails.
pub struct ErrorTransition<C> {
    pub target: String,
    pub action: ErrorAction<C>,
}

impl<C> ErrorTransition<C> {
    pub fn to(
        target: impl Into<String>,
        action: impl Fn(&mut C, &str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            target: target.into(),
            action: Arc::new(action),
        }
    }
}

/// Invoke block of a work state.
pub struct InvokeDef<C, O> {
    pub actor: Arc<dyn StageActor<C, O>>,
    pub on_done: Transition<C, O>,
    pub on_error: ErrorTransition<C>,
}

/// One state: an invoke block, an event table, or a terminal marker,
/// optionally with nested child states.
pub struct StateDef<C, O> {
    pub invoke: Option<InvokeDef<C, O>>,
    pub on: HashMap<String, String>,
    pub terminal: bool,
    pub initial: Option<String>,
    pub states: HashMap<String, StateDef<C, O>>,
}

impl<C, O> Default for StateDef<C, O> {
    fn default() -> Self {
        Self {
            invoke: None,
            on: HashMap::new(),
            terminal: false,
            initial: None,
            states: HashMap::new(),
        }
    }
}

impl<C, O> StateDef<C, O> {
    pub fn invoke(invoke: InvokeDef<C, O>) -> Self {
        Self {
            invoke: Some(invoke),
            ..Default::default()
        }
    }

    pub fn events(pairs: impl IntoIterator<Item = (&'static str, &'static str)>) -> Self {
        Self {
            on: pairs
                .into_iter()
                .map(|(event, target)| (event.to_string(), target.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn terminal() -> Self {
        Self {
            terminal: true,
            ..Default::default()
        }
    }
}

/// The whole stage graph.
pub struct MachineDef<C, O> {
    pub initial: String,
    pub states: HashMap<String, StateDef<C, O>>,
    /// Root-level event table, consulted when no state on the stack
    /// handles an event.
    pub on: HashMap<String, String>,
}

impl<C, O> MachineDef<C, O> {
    /// Depth-first path from the root to a state with the given name.
    fn resolve(&self, name: &str) -> Option<Vec<String>> {
        fn walk<C, O>(
            states: &HashMap<String, StateDef<C, O>>,
            name: &str,
            prefix: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            if states.contains_key(name) {
                let mut path = prefix.clone();
                path.push(name.to_string());
                return Some(path);
            }
            for (id, state) in states {
                prefix.push(id.clone());
                if let Some(found) = walk(&state.states, name, prefix) {
                    return Some(found);
                }
                prefix.pop();
            }
            None
        }
        walk(&self.states, name, &mut Vec::new())
    }

    fn state_at(&self, path: &[String]) -> Option<&StateDef<C, O>> {
        let mut states = &self.states;
        let mut current = None;
        for segment in path {
            current = states.get(segment);
            states = &current?.states;
        }
        current
    }
}

/// The running machine: a definition, a context, and a state stack.
pub struct StateMachine<C, O> {
    def: Arc<MachineDef<C, O>>,
    context: C,
    stack_path: Vec<String>,
    observer: Option<Arc<dyn MachineObserver>>,
}

impl<C, O> StateMachine<C, O>
where
    C: Serialize + DeserializeOwned + Send + Sync,
    O: Send + Sync,
{
    pub fn new(def: Arc<MachineDef<C, O>>, context: C) -> Self {
        Self {
            def,
            context,
            stack_path: Vec::new(),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn MachineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn stack_path(&self) -> &[String] {
        &self.stack_path
    }

    /// Name of the innermost current state.
    pub fn current(&self) -> Option<&str> {
        self.stack_path.last().map(String::as_str)
    }

    pub fn is_terminal(&self) -> bool {
        self.def
            .state_at(&self.stack_path)
            .map(|s| s.terminal)
            .unwrap_or(false)
    }

    /// Enter the initial state and cascade through invokes.
    pub async fn start(&mut self) -> MachineResult<()> {
        let initial = self.def.initial.clone();
        self.enter(&initial).await
    }

    /// Re-enter the current state after a restore. Runs the state's
    /// invoke when it has one; review and terminal states are no-ops.
    pub async fn resume(&mut self) -> MachineResult<()> {
        let Some(current) = self.current().map(str::to_string) else {
            return Err(MachineError::NotStarted);
        };
        self.enter(&current).await
    }

    /// Deliver an external event. Consults the event tables from the
    /// innermost state outwards, then the root table; unknown events are
    /// ignored.
    pub async fn send(&mut self, event: &str) -> MachineResult<()> {
        if self.stack_path.is_empty() {
            return Err(MachineError::NotStarted);
        }
        for depth in (0..self.stack_path.len()).rev() {
            let path = &self.stack_path[..=depth];
            let Some(state) = self.def.state_at(path) else {
                continue;
            };
            if let Some(target) = state.on.get(event).cloned() {
                info!("Event {} -> {}", event, target);
                return self.enter(&target).await;
            }
        }
        if let Some(target) = self.def.on.get(event).cloned() {
            info!("Event {} -> {} (root table)", event, target);
            return self.enter(&target).await;
        }
        debug!("Ignoring unknown event: {}", event);
        Ok(())
    }

    /// Enter a state by name, descend through nested initials, and run
    /// the invoke cascade until a state without an invoke is reached.
    async fn enter(&mut self, name: &str) -> MachineResult<()> {
        let mut next = name.to_string();
        loop {
            let mut path = self
                .def
                .resolve(&next)
                .ok_or_else(|| MachineError::UnknownState(next.clone()))?;
            // Descend into nested initial states.
            while let Some(state) = self.def.state_at(&path) {
                match &state.initial {
                    Some(initial) => path.push(initial.clone()),
                    None => break,
                }
            }
            self.stack_path = path;
            let current = self.current().unwrap_or_default().to_string();
            info!("Entering state: {}", current);
            if let Some(observer) = &self.observer {
                observer.on_enter(&current).await;
            }

            let state = self
                .def
                .state_at(&self.stack_path)
                .ok_or_else(|| MachineError::UnknownState(current.clone()))?;
            let Some(invoke) = &state.invoke else {
                self.checkpoint_observer().await?;
                return Ok(());
            };

            let actor = invoke.actor.clone();
            match actor.execute(&self.context).await {
                Ok(output) => {
                    // The transition fires atomically: every action runs
                    // against the context before the next state is entered.
                    for action in &invoke.on_done.actions {
                        action(&mut self.context, &output);
                    }
                    next = invoke.on_done.target.clone();
                }
                Err(error_text) => {
                    info!("Invoke failed in {}: {}", current, error_text);
                    (invoke.on_error.action)(&mut self.context, &error_text);
                    next = invoke.on_error.target.clone();
                }
            }
            self.checkpoint_observer().await?;
        }
    }

    async fn checkpoint_observer(&self) -> MachineResult<()> {
        if let Some(observer) = &self.observer {
            let checkpoint = self.dump()?;
            observer.on_checkpoint(&checkpoint).await;
        }
        Ok(())
    }

    /// Serialize the machine into `{ stack_path, context }`.
    pub fn dump(&self) -> MachineResult<MachineCheckpoint> {
        Ok(MachineCheckpoint {
            stack_path: self.stack_path.clone(),
            context: serde_json::to_value(&self.context)?,
        })
    }

    /// Rebuild a machine from a checkpoint against the same definition.
    pub fn restore(
        def: Arc<MachineDef<C, O>>,
        checkpoint: &MachineCheckpoint,
    ) -> MachineResult<Self> {
        let context: C = serde_json::from_value(checkpoint.context.clone())?;
        Ok(Self {
            def,
            context,
            stack_path: checkpoint.stack_path.clone(),
            observer: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct Ctx {
        log: Vec<String>,
        error: Option<String>,
    }

    struct Appender(&'static str, bool);

    #[async_trait::async_trait]
    impl StageActor<Ctx, String> for Appender {
        async fn execute(&self, _ctx: &Ctx) -> Result<String, String> {
            if self.1 {
                Ok(self.0.to_string())
            } else {
                Err(format!("{} failed", self.0))
            }
        }
    }

    fn two_stage_def(second_ok: bool) -> Arc<MachineDef<Ctx, String>> {
        let mut states = HashMap::new();
        states.insert(
            "first".to_string(),
            StateDef::invoke(InvokeDef {
                actor: Arc::new(Appender("first", true)),
                on_done: Transition::to("second")
                    .action(|ctx: &mut Ctx, out: &String| ctx.log.push(out.clone())),
                on_error: ErrorTransition::to("failure", |ctx: &mut Ctx, e: &str| {
                    ctx.error = Some(e.to_string())
                }),
            }),
        );
        states.insert(
            "second".to_string(),
            StateDef::invoke(InvokeDef {
                actor: Arc::new(Appender("second", second_ok)),
                on_done: Transition::to("complete")
                    .action(|ctx: &mut Ctx, out: &String| ctx.log.push(out.clone())),
                on_error: ErrorTransition::to("failure", |ctx: &mut Ctx, e: &str| {
                    ctx.error = Some(e.to_string())
                }),
            }),
        );
        states.insert("complete".to_string(), StateDef::terminal());
        states.insert("failure".to_string(), StateDef::terminal());
        Arc::new(MachineDef {
            initial: "first".to_string(),
            states,
            on: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn cascade_runs_to_complete() {
        let mut machine = StateMachine::new(two_stage_def(true), Ctx::default());
        machine.start().await.unwrap();
        assert_eq!(machine.current(), Some("complete"));
        assert!(machine.is_terminal());
        assert_eq!(machine.context().log, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn invoke_error_routes_to_failure() {
        let mut machine = StateMachine::new(two_stage_def(false), Ctx::default());
        machine.start().await.unwrap();
        assert_eq!(machine.current(), Some("failure"));
        assert_eq!(machine.context().error.as_deref(), Some("second failed"));
        assert_eq!(machine.context().log, vec!["first"]);
    }

    #[tokio::test]
    async fn checkpoint_round_trips() {
        let def = two_stage_def(true);
        let mut machine = StateMachine::new(def.clone(), Ctx::default());
        machine.start().await.unwrap();

        let checkpoint = machine.dump().unwrap();
        let restored = StateMachine::restore(def, &checkpoint).unwrap();
        assert_eq!(restored.stack_path(), machine.stack_path());
        assert_eq!(restored.context(), machine.context());
        assert_eq!(restored.dump().unwrap(), checkpoint);
    }

    #[tokio::test]
    async fn observer_sees_entries_and_checkpoints() {
        use std::sync::Mutex as StdMutex;

        #[derive(Default)]
        struct Recorder {
            entries: StdMutex<Vec<String>>,
            checkpoints: StdMutex<usize>,
        }

        #[async_trait::async_trait]
        impl MachineObserver for Recorder {
            async fn on_enter(&self, state: &str) {
                self.entries.lock().unwrap().push(state.to_string());
            }

            async fn on_checkpoint(&self, _checkpoint: &MachineCheckpoint) {
                *self.checkpoints.lock().unwrap() += 1;
            }
        }

        let recorder = Arc::new(Recorder::default());
        let mut machine =
            StateMachine::new(two_stage_def(true), Ctx::default()).with_observer(recorder.clone());
        machine.start().await.unwrap();

        assert_eq!(
            *recorder.entries.lock().unwrap(),
            vec!["first", "second", "complete"]
        );
        // One checkpoint per completed transition, plus the final state.
        assert_eq!(*recorder.checkpoints.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn unknown_events_are_ignored() {
        let mut machine = StateMachine::new(two_stage_def(true), Ctx::default());
        machine.start().await.unwrap();
        machine.send("NOT_A_THING").await.unwrap();
        assert_eq!(machine.current(), Some("complete"));
    }

    #[tokio::test]
    async fn review_state_waits_for_events() {
        let mut states: HashMap<String, StateDef<Ctx, String>> = HashMap::new();
        states.insert(
            "work".to_string(),
            StateDef::invoke(InvokeDef {
                actor: Arc::new(Appender("work", true)),
                on_done: Transition::to("review"),
                on_error: ErrorTransition::to("failure", |_, _| {}),
            }),
        );
        states.insert(
            "review".to_string(),
            StateDef::events([("CONFIRM", "complete"), ("REVISE_WORK", "work")]),
        );
        states.insert("complete".to_string(), StateDef::terminal());
        states.insert("failure".to_string(), StateDef::terminal());
        let def = Arc::new(MachineDef {
            initial: "work".to_string(),
            states,
            on: HashMap::new(),
        });

        let mut machine = StateMachine::new(def, Ctx::default());
        machine.start().await.unwrap();
        assert_eq!(machine.current(), Some("review"));
        assert!(!machine.is_terminal());

        machine.send("REVISE_WORK").await.unwrap();
        assert_eq!(machine.current(), Some("review"));

        machine.send("CONFIRM").await.unwrap();
        assert_eq!(machine.current(), Some("complete"));
    }

    #[tokio::test]
    async fn nested_initial_descends() {
        let mut child_states: HashMap<String, StateDef<Ctx, String>> = HashMap::new();
        child_states.insert("inner".to_string(), StateDef::events([("GO", "complete")]));
        let parent = StateDef {
            initial: Some("inner".to_string()),
            states: child_states,
            ..Default::default()
        };
        let mut states = HashMap::new();
        states.insert("outer".to_string(), parent);
        states.insert("complete".to_string(), StateDef::terminal());
        let def = Arc::new(MachineDef {
            initial: "outer".to_string(),
            states,
            on: HashMap::new(),
        });

        let mut machine = StateMachine::new(def, Ctx::default());
        machine.start().await.unwrap();
        assert_eq!(
            machine.stack_path(),
            ["outer".to_string(), "inner".to_string()]
        );
        machine.send("GO").await.unwrap();
        assert_eq!(machine.current(), Some("complete"));
    }
}
