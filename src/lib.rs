pub mod arg_parser;
pub mod daemon;
pub mod errors;
pub mod gpu_control;
pub mod logger;
pub mod oneshot;
pub mod policy_config;
pub mod preflight;
