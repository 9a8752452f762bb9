pub mod app;
pub mod logwatch;
pub mod stream;
