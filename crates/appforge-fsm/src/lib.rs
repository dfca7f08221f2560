//! Hierarchical state machine with invoke semantics
//!
//! States are data: each either invokes an actor (with on_done/on_error
//! transitions whose actions fold the actor's output back into the
//! context) or declares an event → target table. Entering an invoke state
//! runs its actor and cascades; the machine checkpoints after every
//! completed transition. `restore(dump(m)) ≡ m`.

pub mod machine;

pub use machine::{
    ErrorTransition, InvokeDef, MachineCheckpoint, MachineDef, MachineError, MachineObserver,
    MachineResult, StageActor, StateDef, StateMachine, Transition,
};
