//! Generic configured-service helper
//!
//! Every adapter and the controller follow the same contract: one typed
//! config record, one cached data snapshot, and an error counter mirrored by
//! the per-service `pvcontrol_error` gauge. The helper is composed into each
//! component instead of forming a base-class hierarchy; components expose
//! their own typed accessors on top of it.

use crate::metrics::METRICS;
use serde::Serialize;

/// Implemented by every cached data record: each carries the error counter
/// of its service so API consumers see staleness alongside the data.
pub trait ServiceData {
    fn set_error(&mut self, error: u32);
}

/// Config + data cache with error counter, shared by all services.
///
/// Snapshots are replaced wholesale in [`ServiceState::set_data`]; readers
/// always observe a coherent record, never a half-written one.
#[derive(Debug)]
pub struct ServiceState<C, D> {
    name: &'static str,
    config: C,
    data: D,
    error_counter: u32,
}

impl<C, D: ServiceData + Clone> ServiceState<C, D> {
    pub fn new(name: &'static str, config: C, data: D) -> Self {
        METRICS.error.with_label_values(&[name]).set(0);
        Self {
            name,
            config,
            data,
            error_counter: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get the last cached data snapshot.
    pub fn data(&self) -> D {
        self.data.clone()
    }

    pub fn data_ref(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    /// Replace the cached snapshot, stamping the current error counter.
    pub fn set_data(&mut self, mut data: D) {
        data.set_error(self.error_counter);
        self.data = data;
    }

    pub fn error_counter(&self) -> u32 {
        self.error_counter
    }

    pub fn inc_error_counter(&mut self) -> u32 {
        self.error_counter += 1;
        METRICS
            .error
            .with_label_values(&[self.name])
            .set(i64::from(self.error_counter));
        self.data.set_error(self.error_counter);
        self.error_counter
    }

    pub fn reset_error_counter(&mut self) {
        self.error_counter = 0;
        METRICS.error.with_label_values(&[self.name]).set(0);
        self.data.set_error(0);
    }
}

/// `{type, config, data}` view of a service, as served by the control API.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    #[serde(rename = "type")]
    pub type_name: String,
    pub config: serde_json::Value,
    pub data: serde_json::Value,
}

impl<C: Serialize, D: ServiceData + Clone + Serialize> ServiceState<C, D> {
    pub fn view(&self) -> ServiceView {
        ServiceView {
            type_name: self.name.to_string(),
            config: serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null),
            data: serde_json::to_value(&self.data).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize)]
    struct DemoData {
        error: u32,
        value: i32,
    }

    impl ServiceData for DemoData {
        fn set_error(&mut self, error: u32) {
            self.error = error;
        }
    }

    #[test]
    fn set_data_stamps_error_counter() {
        let mut svc = ServiceState::new("DemoService", (), DemoData::default());
        svc.inc_error_counter();
        svc.inc_error_counter();
        svc.set_data(DemoData { error: 0, value: 7 });
        assert_eq!(svc.data(), DemoData { error: 2, value: 7 });
        assert_eq!(svc.error_counter(), 2);

        svc.reset_error_counter();
        assert_eq!(svc.data().error, 0);
        assert_eq!(svc.error_counter(), 0);
    }

    #[test]
    fn view_carries_type_and_records() {
        let mut svc = ServiceState::new("DemoService2", (), DemoData::default());
        svc.set_data(DemoData { error: 0, value: 3 });
        let view = svc.view();
        assert_eq!(view.type_name, "DemoService2");
        assert_eq!(view.data["value"], 3);
    }
}
