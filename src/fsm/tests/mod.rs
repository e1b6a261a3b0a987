pub mod helpers;
mod tests_alloc;
