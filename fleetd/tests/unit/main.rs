mod common;
mod test_api;
mod test_lifecycle;
mod test_progress;
