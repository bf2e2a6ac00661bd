pub mod continuous;
pub mod dispatch_queue;
pub mod executions;
pub mod plan_run;
pub mod registrations;
pub mod state_cache;
