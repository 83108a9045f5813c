//! Latency comparison benchmarks against a BTreeMap-backed baseline.
