// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::propagation::{GlobalPropagator, Propagator, TraceContextPropagator};
use super::INSTRUMENTATION_NAME;
use faststr::FastStr;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::TracerProvider;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Decides per call whether it is traced, given the service and method names.
pub type Filter = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// The tracing configuration shared by the interceptors.
///
/// Built once and shared immutably by every call; the interceptors never modify it.
pub struct Config<T = BoxedTracer> {
    /// The tracer that starts call spans.
    pub(crate) tracer: T,
    /// The format trace contexts travel in, default is [`TraceContextPropagator`]. The process
    /// defaults use [`GlobalPropagator`].
    pub(crate) propagator: Arc<dyn Propagator>,
    /// The `rpc.system` attribute, default is `meshrpc`.
    pub(crate) system: FastStr,
    /// Request metadata keys recorded as `rpc.request.metadata.<key>` on server spans.
    /// Default is none.
    pub(crate) metadata_attributes: Vec<String>,
    /// Calls rejected by the filter are passed through without a span. Default traces all.
    pub(crate) filter: Option<Filter>,
    /// Whether `message` events are recorded, default is true.
    pub(crate) message_events: bool,
}

impl<T> Config<T> {
    /// A config starting spans with `tracer` and default settings otherwise.
    pub fn new(tracer: T) -> Self {
        Self {
            tracer,
            propagator: Arc::new(TraceContextPropagator::new()),
            system: FastStr::from_static_str("meshrpc"),
            metadata_attributes: Vec::new(),
            filter: None,
            message_events: true,
        }
    }

    /// Set the propagation format.
    pub fn with_propagator(mut self, propagator: impl Propagator + 'static) -> Self {
        self.propagator = Arc::new(propagator);
        self
    }

    /// Set the `rpc.system` attribute.
    pub fn with_system(mut self, system: impl Into<FastStr>) -> Self {
        self.system = system.into();
        self
    }

    /// Record the given request metadata keys on server spans.
    pub fn with_metadata_attributes<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.metadata_attributes = keys
            .into_iter()
            .map(|key| {
                let mut key = key.into();
                key.make_ascii_lowercase();
                key
            })
            .collect();
        self
    }

    /// Only trace calls for which `filter(service, method)` returns true.
    pub fn with_filter(mut self, filter: impl Fn(&str, &str) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Enable or disable `message` events.
    pub fn with_message_events(mut self, enabled: bool) -> Self {
        self.message_events = enabled;
        self
    }

    /// The tracer that starts call spans.
    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    /// The propagation format.
    pub fn propagator(&self) -> &dyn Propagator {
        self.propagator.as_ref()
    }

    pub(crate) fn should_trace(&self, service: &str, method: &str) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(service, method))
    }

    /// A config whose tracer comes from `provider`, scoped to this crate.
    pub fn from_provider<P>(provider: &P) -> Self
    where
        P: TracerProvider<Tracer = T>,
    {
        Self::new(provider.tracer(INSTRUMENTATION_NAME))
    }
}

impl Config<BoxedTracer> {
    /// The process default: the global tracer provider and the global text map propagator.
    ///
    /// The tracer is resolved on first use, so install the global provider before that. The
    /// propagator is looked up on every call.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<Config<BoxedTracer>>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Self::default())).clone()
    }
}

impl Default for Config<BoxedTracer> {
    fn default() -> Self {
        Self::new(global::tracer(INSTRUMENTATION_NAME)).with_propagator(GlobalPropagator)
    }
}

impl<T> fmt::Debug for Config<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("propagator", &self.propagator)
            .field("system", &self.system)
            .field("metadata_attributes", &self.metadata_attributes)
            .field("filter", &self.filter.is_some())
            .field("message_events", &self.message_events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use crate::trace::propagation::{CompositePropagator, TraceContextPropagator};
    use opentelemetry::trace::noop::NoopTracer;

    #[test]
    fn defaults() {
        let config = Config::new(NoopTracer::new());
        assert_eq!(config.system.as_str(), "meshrpc");
        assert!(config.message_events);
        assert!(config.metadata_attributes.is_empty());
        assert!(config.should_trace("Greeter", "SayHello"));
        assert_eq!(config.propagator().fields(), vec!["traceparent", "tracestate"]);
    }

    #[test]
    fn builders_override_defaults() {
        let config = Config::new(NoopTracer::new())
            .with_system("ttrpc")
            .with_metadata_attributes(["X-Tenant", "zone"])
            .with_filter(|service, _| service != "grpc.health.v1.Health")
            .with_message_events(false)
            .with_propagator(CompositePropagator::default().with(TraceContextPropagator::new()));
        assert_eq!(config.system.as_str(), "ttrpc");
        assert_eq!(config.metadata_attributes, vec!["x-tenant", "zone"]);
        assert!(!config.should_trace("grpc.health.v1.Health", "Check"));
        assert!(config.should_trace("Greeter", "SayHello"));
        assert!(!config.message_events);
    }
}
