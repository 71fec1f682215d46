/// Prometheus metrics, rendered for the `/metrics` endpoint

pub mod prometheus;
