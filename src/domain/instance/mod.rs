pub mod bundles;
pub mod scheduling_instance;

pub use bundles::{Bundle, bundle_compatible_steps};
pub use scheduling_instance::{
    CompletedStep, LiveProcess, PendingDep, PendingStepView, ProcessReport, ProcessState, ReadyStep, RunningStepView, SchedulerSnapshot,
    SchedulingInstance, StepOutcome, StepState,
};
