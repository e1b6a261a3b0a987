pub mod helpers;
mod tests_batch;
mod tests_rows;
