use tracing::trace;

// Lightweight metrics helpers that stay safe without a live recorder.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "offermart.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn engine_elapsed(engine: &'static str, elapsed_ms: u128) {
    trace!(
        target = "offermart.metrics",
        engine = engine,
        elapsed_ms = elapsed_ms as u64,
        "engine_elapsed"
    );
}
