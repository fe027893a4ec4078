//! Integration-test package for the lazy-zip workspace; see `tests/`.
