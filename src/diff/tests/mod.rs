mod tests_engine;
mod tests_pagination;
mod tests_recovery;
