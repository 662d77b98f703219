pub mod bootstrap;
pub mod fault;
pub mod relay;
pub mod run_loop;
