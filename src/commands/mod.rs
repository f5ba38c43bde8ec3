pub mod fetch;
pub mod run;
pub mod test_notify;
