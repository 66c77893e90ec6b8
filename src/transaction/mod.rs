// Transaction engine: operations, pending-state resolution, manager
pub mod events;
pub mod manager;
pub mod mutation;
pub mod operation;
pub mod pending;
pub mod result;

pub use events::{EventBus, EventKind, Listener, SubscriptionId, TransactionEvent, Unsubscribe};
pub use manager::TransactionManager;
pub use mutation::{mutation_fn, FnMutation, InMemoryRemote, Mutation, MutationRequest};
pub use operation::Operation;
pub use pending::{
    plan_commit, plan_compensation, replay, resolve, EntityPlan, PendingKind, PendingState, PlannedCall, Resolution,
    SkipReason,
};
pub use result::{CommitOutcome, OperationOutcome, OperationResult, Transaction, TransactionStatus, TransactionSummary};
