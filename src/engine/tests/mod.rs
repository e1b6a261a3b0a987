pub mod helpers;
mod tests_failure;
mod tests_log_pressure;
