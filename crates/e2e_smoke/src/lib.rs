//! Holds the end-to-end smoke test under `tests/`; set `TASKLINE_TEST_DB_URL`
//! (or `DATABASE_URL`) to run it.
