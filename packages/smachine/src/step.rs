//! State machines and the step functions that drive them.
//!
//! A state machine is plain data plus a set of step functions. A step is a
//! function value attached to the slot, not a virtual method: the slot stores
//! the current [`SlotStep`] and calls it on every activation. Typed function
//! pointers are erased behind small call traits so that one slot table can hold
//! machines of any type.

use std::any::{type_name, Any};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::context::{
    BargeInContext, ConstructionContext, ExecutionContext, FailureContext, MigrationContext,
};
use crate::error::SlotError;
use crate::update::StateUpdate;

/// Upcast to [`Any`] for state machine downcasts.
pub trait AsAny: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A state machine living in a slot.
///
/// `init` is the first step run for a freshly constructed machine. It
/// typically registers default handlers and jumps to the first real step.
pub trait StateMachine: AsAny {
    /// The init step.
    fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> StateUpdate;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        type_name::<Self>()
    }

    /// Called on every migration of the machine, before the migration
    /// handler and whether or not the slot has one. Must not touch other
    /// slots.
    fn shadow_migrate(&mut self, _migration_count: u32) {}
}

/// An injected local value that follows migrations of its slot.
pub trait ShadowMigrate: Any + Send {
    fn shadow_migrate(&mut self, migration_count: u32);
}

/// Downcast an erased machine to its concrete type.
pub fn downcast_machine<M: StateMachine>(sm: &mut dyn StateMachine) -> Option<&mut M> {
    AsAny::as_any_mut(sm).downcast_mut::<M>()
}

/// A regular step.
pub type StateFn<M> = fn(&mut M, &mut ExecutionContext<'_>) -> StateUpdate;

/// A migration handler, run once per pulse commit.
pub type MigrateFn<M> = fn(&mut M, &mut MigrationContext<'_>) -> StateUpdate;

/// An error handler.
pub type ErrorHandlerFn<M> = fn(&mut M, &mut FailureContext<'_>) -> StateUpdate;

/// The continuation of a parameterized barge-in.
pub type BargeInApplyFn<M> = fn(&mut M, &mut BargeInContext<'_>) -> StateUpdate;

/// Construction function for a new slot.
///
/// Must be free of side effects: it may run on a different thread than the
/// caller and only ever builds the machine.
pub type CreateFn =
    Box<dyn FnOnce(&mut ConstructionContext<'_>) -> Box<dyn StateMachine> + Send + 'static>;

/// Construction function that installs `sm` as is.
pub fn constructor<M: StateMachine>(sm: M) -> CreateFn {
    Box::new(move |_ctx: &mut ConstructionContext<'_>| -> Box<dyn StateMachine> { Box::new(sm) })
}

fn mismatch<M>() -> SlotError {
    SlotError::TypeMismatch {
        expected: type_name::<M>(),
    }
}

pub(crate) trait StepCall: Send + Sync {
    fn call(&self, sm: &mut dyn StateMachine, ctx: &mut ExecutionContext<'_>) -> StateUpdate;
}

pub(crate) trait MigrateCall: Send + Sync {
    fn call(&self, sm: &mut dyn StateMachine, ctx: &mut MigrationContext<'_>) -> StateUpdate;
}

pub(crate) trait FailureCall: Send + Sync {
    fn call(&self, sm: &mut dyn StateMachine, ctx: &mut FailureContext<'_>) -> StateUpdate;
}

pub(crate) trait BargeInCall: Send + Sync {
    fn call(&self, sm: &mut dyn StateMachine, ctx: &mut BargeInContext<'_>) -> StateUpdate;
}

struct TypedStep<M>(StateFn<M>);
struct TypedMigrate<M>(MigrateFn<M>);
struct TypedFailure<M>(ErrorHandlerFn<M>);
pub(crate) struct TypedBargeIn<M>(pub(crate) BargeInApplyFn<M>);

impl<M: StateMachine> StepCall for TypedStep<M> {
    fn call(&self, sm: &mut dyn StateMachine, ctx: &mut ExecutionContext<'_>) -> StateUpdate {
        match downcast_machine::<M>(sm) {
            Some(m) => (self.0)(m, ctx),
            None => ctx.fail(mismatch::<M>()),
        }
    }
}

impl<M: StateMachine> MigrateCall for TypedMigrate<M> {
    fn call(&self, sm: &mut dyn StateMachine, ctx: &mut MigrationContext<'_>) -> StateUpdate {
        match downcast_machine::<M>(sm) {
            Some(m) => (self.0)(m, ctx),
            None => ctx.fail(mismatch::<M>()),
        }
    }
}

impl<M: StateMachine> FailureCall for TypedFailure<M> {
    fn call(&self, sm: &mut dyn StateMachine, ctx: &mut FailureContext<'_>) -> StateUpdate {
        match downcast_machine::<M>(sm) {
            Some(m) => (self.0)(m, ctx),
            None => ctx.stop(),
        }
    }
}

impl<M: StateMachine> BargeInCall for TypedBargeIn<M> {
    fn call(&self, sm: &mut dyn StateMachine, ctx: &mut BargeInContext<'_>) -> StateUpdate {
        match downcast_machine::<M>(sm) {
            Some(m) => (self.0)(m, ctx),
            None => ctx.fail(mismatch::<M>()),
        }
    }
}

/// Scheduling flags of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepFlags(u8);

impl StepFlags {
    pub const NONE: StepFlags = StepFlags(0);

    /// Activations of the step go to the front of the active queue.
    pub const PRIORITY: StepFlags = StepFlags(1);

    pub fn contains(self, other: StepFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StepFlags {
    type Output = StepFlags;

    fn bitor(self, rhs: StepFlags) -> StepFlags {
        StepFlags(self.0 | rhs.0)
    }
}

/// A step with its optional per-step migration and error handler overrides.
#[derive(Clone)]
pub struct SlotStep {
    pub(crate) transition: Arc<dyn StepCall>,
    pub(crate) migration: Option<Arc<dyn MigrateCall>>,
    pub(crate) handler: Option<Arc<dyn FailureCall>>,
    pub(crate) flags: StepFlags,
}

impl SlotStep {
    pub fn new<M: StateMachine>(transition: StateFn<M>) -> Self {
        Self {
            transition: Arc::new(TypedStep(transition)),
            migration: None,
            handler: None,
            flags: StepFlags::NONE,
        }
    }

    /// Override the slot's default migration while at this step.
    pub fn with_migration<M: StateMachine>(mut self, migration: MigrateFn<M>) -> Self {
        self.migration = Some(Arc::new(TypedMigrate(migration)));
        self
    }

    /// Override the slot's default error handler while at this step.
    pub fn with_error_handler<M: StateMachine>(mut self, handler: ErrorHandlerFn<M>) -> Self {
        self.handler = Some(Arc::new(TypedFailure(handler)));
        self
    }

    pub fn with_flags(mut self, flags: StepFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl fmt::Debug for SlotStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotStep")
            .field("migration", &self.migration.is_some())
            .field("handler", &self.handler.is_some())
            .field("flags", &self.flags)
            .finish()
    }
}

pub(crate) fn migrate_call<M: StateMachine>(f: MigrateFn<M>) -> Arc<dyn MigrateCall> {
    Arc::new(TypedMigrate(f))
}

pub(crate) fn failure_call<M: StateMachine>(f: ErrorHandlerFn<M>) -> Arc<dyn FailureCall> {
    Arc::new(TypedFailure(f))
}

type ShadowFn = fn(&mut (dyn Any + Send), u32);

fn shadow_of<T: ShadowMigrate>(value: &mut (dyn Any + Send), migration_count: u32) {
    if let Some(value) = value.downcast_mut::<T>() {
        value.shadow_migrate(migration_count);
    }
}

struct Inject {
    value: Box<dyn Any + Send>,
    shadow: Option<ShadowFn>,
}

/// Values injected at construction, visible only to the slot's own steps.
#[derive(Default)]
pub struct LocalInjects {
    values: Vec<Inject>,
}

impl LocalInjects {
    fn push(&mut self, inject: Inject) {
        let type_id = (*inject.value).type_id();
        self.values.retain(|v| (*v.value).type_id() != type_id);
        self.values.push(inject);
    }

    pub(crate) fn insert<T: Any + Send>(&mut self, value: T) {
        self.push(Inject {
            value: Box::new(value),
            shadow: None,
        });
    }

    pub(crate) fn insert_shadow<T: ShadowMigrate>(&mut self, value: T) {
        self.push(Inject {
            value: Box::new(value),
            shadow: Some(shadow_of::<T>),
        });
    }

    /// The injected value of type `T`.
    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.values.iter().find_map(|v| v.value.downcast_ref::<T>())
    }

    pub(crate) fn extend(&mut self, other: LocalInjects) {
        for inject in other.values {
            self.push(inject);
        }
    }

    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.values
            .iter_mut()
            .find_map(|v| v.value.downcast_mut::<T>())
    }

    /// Run the shadow migration of every value that has one.
    pub(crate) fn shadow_migrate(&mut self, migration_count: u32) {
        for inject in &mut self.values {
            if let Some(shadow) = inject.shadow {
                shadow(&mut *inject.value, migration_count);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for LocalInjects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalInjects({})", self.values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    struct Beta;

    impl StateMachine for Alpha {
        fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> StateUpdate {
            ctx.stop()
        }
    }

    impl StateMachine for Beta {
        fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> StateUpdate {
            ctx.stop()
        }
    }

    #[test]
    fn downcast_matches_concrete_type() {
        let mut sm: Box<dyn StateMachine> = Box::new(Alpha);
        assert!(downcast_machine::<Alpha>(&mut *sm).is_some());
        assert!(downcast_machine::<Beta>(&mut *sm).is_none());
        assert!(sm.name().ends_with("Alpha"));
    }

    #[test]
    fn flags_combine() {
        let flags = StepFlags::NONE | StepFlags::PRIORITY;
        assert!(flags.contains(StepFlags::PRIORITY));
        assert!(!StepFlags::NONE.contains(StepFlags::PRIORITY));
    }

    #[test]
    fn injects_are_typed() {
        let mut injects = LocalInjects::default();
        injects.insert(5_u32);
        injects.insert(String::from("x"));
        injects.insert(7_u32);
        assert_eq!(injects.len(), 2);
        assert_eq!(injects.get::<u32>(), Some(&7));
        injects.get_mut::<String>().unwrap().push('y');
        assert_eq!(injects.get::<String>().map(String::as_str), Some("xy"));
        assert!(injects.get::<i64>().is_none());
    }

    struct Epoch(u32);

    impl ShadowMigrate for Epoch {
        fn shadow_migrate(&mut self, migration_count: u32) {
            self.0 = migration_count;
        }
    }

    #[test]
    fn shadow_injects_follow_migrations() {
        let mut injects = LocalInjects::default();
        injects.insert_shadow(Epoch(0));
        injects.insert(1_u32);
        injects.shadow_migrate(3);
        assert_eq!(injects.get::<Epoch>().map(|e| e.0), Some(3));
        assert_eq!(injects.get::<u32>(), Some(&1));

        let mut other = LocalInjects::default();
        other.insert(Epoch(9));
        injects.extend(other);
        injects.shadow_migrate(4);
        assert_eq!(injects.get::<Epoch>().map(|e| e.0), Some(9));
    }
}
