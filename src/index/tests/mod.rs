mod tests_ordered;
