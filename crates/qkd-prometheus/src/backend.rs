use async_trait::async_trait;
use prometheus::{Gauge, GaugeVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, proto::MetricFamily};
use qkd_core::{FaultKind, StatusBoard, Subscribe};
use qkd_model::{LinkEvent, Subsystem};

#[derive(Clone)]
pub struct LinkMetrics {
    registry: Registry,
    connected: IntGauge,
    running: IntGaugeVec,
    coincidences: IntGauge,
    accidentals: IntGauge,
    frequency_correction: Gauge,
    servoed_qber: Gauge,
    error_fraction: Gauge,
    final_bits: GaugeVec,
    restarts: IntCounterVec,
}

impl LinkMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let connected = IntGauge::with_opts(Opts::new("qkd_link_connected", "1 while the partner session is up"))?;
        let running = IntGaugeVec::new(
            Opts::new("qkd_process_running", "1 while the subsystem's program is running"),
            &["subsystem"],
        )?;
        let coincidences = IntGauge::with_opts(Opts::new("qkd_coincidences", "Coincidences in the last matcher report"))?;
        let accidentals = IntGauge::with_opts(Opts::new("qkd_accidentals", "Accidentals in the last matcher report"))?;
        let frequency_correction = Gauge::with_opts(Opts::new(
            "qkd_frequency_correction",
            "Running fractional clock frequency correction",
        ))?;
        let servoed_qber = Gauge::with_opts(Opts::new("qkd_servoed_qber", "QBER estimate fed to error correction"))?;
        let error_fraction = Gauge::with_opts(Opts::new(
            "qkd_error_fraction",
            "Error fraction of the last corrected block",
        ))?;
        let final_bits = GaugeVec::new(
            Opts::new("qkd_final_key_bits_total", "Final key bits produced since start"),
            &["node"],
        )?;
        let restarts = IntCounterVec::new(
            Opts::new("qkd_restarts_total", "Restart requests by subsystem and fault"),
            &["subsystem", "reason"],
        )?;

        registry.register(Box::new(connected.clone()))?;
        registry.register(Box::new(running.clone()))?;
        registry.register(Box::new(coincidences.clone()))?;
        registry.register(Box::new(accidentals.clone()))?;
        registry.register(Box::new(frequency_correction.clone()))?;
        registry.register(Box::new(servoed_qber.clone()))?;
        registry.register(Box::new(error_fraction.clone()))?;
        registry.register(Box::new(final_bits.clone()))?;
        registry.register(Box::new(restarts.clone()))?;

        Ok(Self {
            registry,
            connected,
            running,
            coincidences,
            accidentals,
            frequency_correction,
            servoed_qber,
            error_fraction,
            final_bits,
            restarts,
        })
    }

    /// Copy the board's current values into the gauges.
    pub fn observe(&self, board: &StatusBoard) {
        let link = board.link();
        self.connected.set(i64::from(link.connection.is_connected()));
        self.coincidences.set(saturating_i64(link.coincidences));
        self.accidentals.set(saturating_i64(link.accidentals));
        self.frequency_correction.set(link.frequency_correction);

        let processes = board.processes();
        for subsystem in std::iter::once(Subsystem::Transfer).chain(Subsystem::KEY_GENERATION) {
            self.running
                .with_label_values(&[subsystem.as_str()])
                .set(i64::from(processes.is_running(subsystem)));
        }

        let ec = board.error_correction();
        self.servoed_qber.set(ec.servoed_qber);
        self.error_fraction.set(ec.last_error_fraction);
        self.final_bits
            .with_label_values(&[link.node.as_str()])
            .set(ec.cumulative_final_bits as f64);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }
}

#[async_trait]
impl Subscribe for LinkMetrics {
    async fn on_event(&self, event: &LinkEvent) {
        if let LinkEvent::RestartRequested { subsystem, reason } = event {
            let kind = format!("{:?}", FaultKind::from(reason));
            self.restarts
                .with_label_values(&[subsystem.as_str(), kind.as_str()])
                .inc();
        }
    }

    fn name(&self) -> &'static str {
        "metrics"
    }
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
