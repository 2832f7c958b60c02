//! Keys-volume lifecycle and drive activation.

mod activate;
mod guard;
mod keys_device;


use log::{debug, error, info, warn};

pub use activate::{DriveActivation, DriveActivator};
pub use keys_device::{
    initialize_keys_device, Environment, KeysDeviceOptions, KeysDeviceSummary, IMAGE_SIZE,
};

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowLevel {
    Debug,
    Info,
    Success,
    Warn,
    Error,
}

/// Single line of progress produced by a workflow step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Receives progress events from a running workflow.
pub trait WorkflowObserver {
    fn record(&mut self, event: WorkflowEvent);
}

/// Collects events in order; handy for reports and tests.
impl WorkflowObserver for Vec<WorkflowEvent> {
    fn record(&mut self, event: WorkflowEvent) {
        self.push(event);
    }
}

/// Forwards events to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl WorkflowObserver for LogObserver {
    fn record(&mut self, event: WorkflowEvent) {
        match event.level {
            WorkflowLevel::Debug => debug!("{}", event.message),
            WorkflowLevel::Info | WorkflowLevel::Success => info!("{}", event.message),
            WorkflowLevel::Warn => warn!("{}", event.message),
            WorkflowLevel::Error => error!("{}", event.message),
        }
    }
}

pub(crate) fn emit(
    observer: &mut dyn WorkflowObserver,
    level: WorkflowLevel,
    message: impl Into<String>,
) {
    observer.record(WorkflowEvent {
        level,
        message: message.into(),
    });
}

/// `pluralize(2, "drive")` is `"2 drives"`.
pub(crate) fn pluralize(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("1 {noun}")
    } else {
        format!("{count} {noun}s")
    }
}
