pub mod batch_fit;
pub mod coordinator;
pub mod cost_scale;
pub mod grad_norm;
pub mod optimizer;
pub mod persistence;
pub mod reference;
pub mod scheduler;
pub mod unit;
