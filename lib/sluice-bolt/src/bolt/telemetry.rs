use metrics::Counter;
use sluice_metrics::MetricsBuilder;

#[derive(Clone)]
pub(super) struct Telemetry {
    ticks_acked: Counter,
    records_acked: Counter,
    records_failed: Counter,
    mapping_errors: Counter,
    submit_errors: Counter,
    delivery_errors: Counter,
}

impl Telemetry {
    pub fn new(component_id: &str) -> Self {
        let builder = MetricsBuilder::default().with_tag("component_id", component_id.to_string());

        Self {
            ticks_acked: builder.register_debug_counter("bolt_ticks_acked_total"),
            records_acked: builder.register_counter("bolt_records_acked_total"),
            records_failed: builder.register_counter("bolt_records_failed_total"),
            mapping_errors: builder.register_counter_with_tags("bolt_errors_total", [("error_type", "mapping")]),
            submit_errors: builder.register_counter_with_tags("bolt_errors_total", [("error_type", "submit")]),
            delivery_errors: builder.register_counter_with_tags("bolt_errors_total", [("error_type", "delivery")]),
        }
    }

    pub fn tick_acked(&self) {
        self.ticks_acked.increment(1);
    }

    pub fn record_acked(&self) {
        self.records_acked.increment(1);
    }

    pub fn record_failed(&self) {
        self.records_failed.increment(1);
    }

    pub fn mapping_error(&self) {
        self.mapping_errors.increment(1);
    }

    pub fn submit_error(&self) {
        self.submit_errors.increment(1);
    }

    pub fn delivery_error(&self) {
        self.delivery_errors.increment(1);
    }
}
