mod tests_checkpoint;
