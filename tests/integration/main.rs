// Integration tests run against the in-process broker unless marked #[ignore]

mod common;
mod connection_test;
mod scenario_test;
