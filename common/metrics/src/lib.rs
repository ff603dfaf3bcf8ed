//! A wrapper around the `prometheus` crate that provides a global,
//! lazy-initialised metrics registry and functions to add and use metrics.
//!
//! All metrics are registered against the default registry. The `try_create`
//! functions return a `Result` so statics can fail gracefully (e.g. when a
//! name collides in tests); the access helpers accept `&Result<..>` and
//! silently no-op on the error path.

pub use prometheus::{
    Histogram, HistogramTimer, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Result,
};
use prometheus::{HistogramOpts, Opts};

pub fn try_create_int_counter(name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    prometheus::register(Box::new(counter.clone()))?;
    Ok(counter)
}

pub fn try_create_int_counter_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<IntCounterVec> {
    let counter_vec = IntCounterVec::new(Opts::new(name, help), label_names)?;
    prometheus::register(Box::new(counter_vec.clone()))?;
    Ok(counter_vec)
}

pub fn try_create_int_gauge(name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    prometheus::register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

pub fn try_create_int_gauge_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<IntGaugeVec> {
    let gauge_vec = IntGaugeVec::new(Opts::new(name, help), label_names)?;
    prometheus::register(Box::new(gauge_vec.clone()))?;
    Ok(gauge_vec)
}

pub fn try_create_histogram(name: &str, help: &str) -> Result<Histogram> {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help))?;
    prometheus::register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

pub fn try_create_histogram_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<HistogramVec> {
    let histogram_vec = HistogramVec::new(HistogramOpts::new(name, help), label_names)?;
    prometheus::register(Box::new(histogram_vec.clone()))?;
    Ok(histogram_vec)
}

pub fn inc_counter(counter: &Result<IntCounter>) {
    if let Ok(counter) = counter {
        counter.inc();
    }
}

pub fn inc_counter_vec(counter: &Result<IntCounterVec>, name: &[&str]) {
    if let Ok(counter) = counter {
        if let Ok(counter) = counter.get_metric_with_label_values(name) {
            counter.inc();
        }
    }
}

pub fn get_int_counter_value(counter: &Result<IntCounter>) -> u64 {
    counter.as_ref().map(|c| c.get()).unwrap_or(0)
}

pub fn set_gauge(gauge: &Result<IntGauge>, value: i64) {
    if let Ok(gauge) = gauge {
        gauge.set(value);
    }
}

pub fn set_gauge_vec(gauge: &Result<IntGaugeVec>, name: &[&str], value: i64) {
    if let Ok(gauge) = gauge {
        if let Ok(gauge) = gauge.get_metric_with_label_values(name) {
            gauge.set(value);
        }
    }
}

pub fn get_int_gauge_value(gauge: &Result<IntGauge>) -> i64 {
    gauge.as_ref().map(|g| g.get()).unwrap_or(0)
}

pub fn start_timer(histogram: &Result<Histogram>) -> Option<HistogramTimer> {
    histogram.as_ref().map(|h| h.start_timer()).ok()
}

pub fn start_timer_vec(histogram: &Result<HistogramVec>, name: &[&str]) -> Option<HistogramTimer> {
    if let Ok(histogram) = histogram {
        histogram
            .get_metric_with_label_values(name)
            .map(|h| h.start_timer())
            .ok()
    } else {
        None
    }
}

pub fn observe(histogram: &Result<Histogram>, value: f64) {
    if let Ok(histogram) = histogram {
        histogram.observe(value);
    }
}

pub fn observe_vec(histogram: &Result<HistogramVec>, name: &[&str], value: f64) {
    if let Ok(histogram) = histogram {
        if let Ok(histogram) = histogram.get_metric_with_label_values(name) {
            histogram.observe(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_round_trip() {
        let counter = try_create_int_counter("metrics_test_counter", "help");
        inc_counter(&counter);
        inc_counter(&counter);
        assert_eq!(get_int_counter_value(&counter), 2);
    }

    #[test]
    fn duplicate_registration_is_an_error_not_a_panic() {
        let first = try_create_int_gauge("metrics_test_gauge", "help");
        assert!(first.is_ok());
        let second = try_create_int_gauge("metrics_test_gauge", "help");
        assert!(second.is_err());
        // Access helpers no-op on the error path.
        set_gauge(&second, 1);
    }
}
