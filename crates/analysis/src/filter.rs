//! Distance filter: enriches position updates with the spacing to every other
//! known vehicle.
//!
//! Vehicle listeners only enqueue messages; one worker thread drains the queue
//! and runs the enrichment, so `store` and `last` are only ever touched by one
//! message at a time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use overdrive_link_core::{channel, Distance, ListenerId, MessageRx, MessageTx, PositionUpdate, Vehicle, VehicleMessage};
use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::track::{Track, TrackError, TrackPoint};

/// Length subtracted from every horizontal distance to turn center-to-center
/// spacing into bumper-to-bumper spacing.
pub const DEFAULT_VEHICLE_LENGTH_MM: f64 = 8.5;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FilterError {
    #[error("filter has already been started")]
    AlreadyStarted,
    #[error("filter is not running")]
    NotStarted,
    #[error(transparent)]
    Track(#[from] TrackError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    pub vehicle_length_mm: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { vehicle_length_mm: DEFAULT_VEHICLE_LENGTH_MM }
    }
}

/// Physical length of one step between adjacent markers.
pub trait TransitionCostModel: Send + Sync {
    fn distance_for_transition(&self, track: &Track, lane: usize, from: TrackPoint, to: TrackPoint)
        -> Result<f64, TrackError>;
}

/// Reads step lengths from the track's transition table, keyed by the kind of
/// the piece being left.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableCostModel;

impl TransitionCostModel for TableCostModel {
    fn distance_for_transition(
        &self,
        track: &Track,
        lane: usize,
        from: TrackPoint,
        _to: TrackPoint,
    ) -> Result<f64, TrackError> {
        track.transition_length(track.find_piece(from.piece)?.kind(), lane)
    }
}

/// Receives enrichment faults. The faulty message is dropped either way.
pub trait ErrorSink: Send + Sync {
    fn handle_error(&self, error: &FilterError, message: &PositionUpdate);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn handle_error(&self, error: &FilterError, message: &PositionUpdate) {
        tracing::warn!(
            vehicle = %message.vehicle_id,
            piece = message.piece,
            location = message.location,
            error = %error,
            "dropped position update"
        );
    }
}

/// Counts faults and keeps the most recent one.
#[derive(Default)]
pub struct CountingErrorSink {
    count: AtomicUsize,
    last: Mutex<Option<(String, FilterError)>>,
}

impl CountingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Vehicle id and error of the latest fault.
    pub fn last(&self) -> Option<(String, String)> {
        self.last.lock().as_ref().map(|(v, e)| (v.clone(), e.to_string()))
    }
}

impl ErrorSink for CountingErrorSink {
    fn handle_error(&self, error: &FilterError, message: &PositionUpdate) {
        LogErrorSink.handle_error(error, message);
        *self.last.lock() = Some((message.vehicle_id.clone(), error.clone()));
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

pub type UpdateListener = Arc<dyn Fn(VehicleMessage) + Send + Sync>;

#[derive(Default)]
struct FilterState {
    /// current snapshot per vehicle
    store: BTreeMap<String, PositionUpdate>,
    /// snapshot that was current before the latest `store` update
    last: BTreeMap<String, PositionUpdate>,
}

struct Engine {
    track: Arc<Track>,
    cost: Arc<dyn TransitionCostModel>,
    errors: Arc<dyn ErrorSink>,
    clock: Arc<dyn Clock>,
    config: FilterConfig,
    state: Arc<Mutex<FilterState>>,
    listener: UpdateListener,
}

impl Engine {
    fn run(self, rx: MessageRx) {
        for message in rx.iter() {
            self.process(message);
        }
        tracing::debug!("distance filter queue closed");
    }

    fn process(&self, message: VehicleMessage) {
        match message {
            VehicleMessage::Position(update) => self.process_position(update),
            other => (self.listener)(other),
        }
    }

    fn process_position(&self, update: PositionUpdate) {
        let result = {
            let mut state = self.state.lock();
            self.enrich(&mut state, update.clone())
        };
        match result {
            Ok(enriched) => {
                tracing::debug!(
                    vehicle = %enriched.vehicle_id,
                    lane = ?enriched.lane,
                    position = ?enriched.position,
                    "enriched position update"
                );
                (self.listener)(VehicleMessage::Position(enriched));
            }
            Err(e) => self.errors.handle_error(&e, &update),
        }
    }

    /// Nothing in `state` changes unless every distance could be computed.
    fn enrich(&self, state: &mut FilterState, mut message: PositionUpdate) -> Result<PositionUpdate, FilterError> {
        let lane = self.track.find_lane(message.piece, message.location)?;
        let position = self.track.find_piece(message.piece)?.location_index(lane, message.location)?;
        message.lane = Some(lane);
        message.position = Some(position);

        let id = message.vehicle_id.clone();
        let previous = state.store.get(&id);
        let now = self.clock.now();
        let mut distances = Vec::with_capacity(state.store.len().saturating_sub(1));
        for (other_id, other) in &state.store {
            if *other_id == id {
                continue;
            }
            distances.push(self.distance_between(previous, &message, lane, other, now)?);
        }
        message.distances = Some(distances);

        if let Some(previous) = state.store.insert(id.clone(), message.clone()) {
            state.last.insert(id, previous);
        }
        Ok(message)
    }

    fn distance_between(
        &self,
        last: Option<&PositionUpdate>,
        m1: &PositionUpdate,
        lane: usize,
        m2: &PositionUpdate,
        now: OffsetDateTime,
    ) -> Result<Distance, FilterError> {
        let horizontal = self.horizontal_distance(m1, lane, m2, now)?;
        let delta = last
            .and_then(|l| l.distance_to(&m2.vehicle_id))
            .map(|previous| horizontal - previous.horizontal);

        Ok(Distance {
            vehicle: m2.vehicle_id.clone(),
            vertical: (m1.offset - m2.offset).abs() as f64,
            horizontal,
            delta,
        })
    }

    fn horizontal_distance(
        &self,
        m1: &PositionUpdate,
        lane: usize,
        m2: &PositionUpdate,
        now: OffsetDateTime,
    ) -> Result<f64, FilterError> {
        let from = TrackPoint::new(m1.piece, m1.location);
        let to = self.approximate_location(lane, m2)?;

        let mut distance = 0.0;
        self.track.each_transition(lane, from, to, |a, b| {
            distance += self.cost.distance_for_transition(&self.track, lane, a, b)?;
            Ok::<(), FilterError>(())
        })?;

        // m2 kept driving since it reported
        let elapsed = (now - m2.timestamp).as_seconds_f64().max(0.0);
        distance += m2.speed as f64 * elapsed;

        Ok(distance - self.config.vehicle_length_mm)
    }

    /// Projects m2's position onto `lane`. When that lane has fewer markers on
    /// m2's piece (inner lane of a curve) its last marker is used, so the
    /// result is an approximation near piece boundaries.
    fn approximate_location(&self, lane: usize, m2: &PositionUpdate) -> Result<TrackPoint, FilterError> {
        let piece = self.track.find_piece(m2.piece)?;
        let position = match m2.position {
            Some(p) => p,
            None => {
                let other_lane = self.track.find_lane(m2.piece, m2.location)?;
                piece.location_index(other_lane, m2.location)?
            }
        };
        let markers = piece.lane(lane)?;
        let location = markers
            .get(position)
            .or_else(|| markers.last())
            .copied()
            .ok_or(TrackError::EmptyLane { piece: piece.id(), lane })?;
        Ok(TrackPoint::new(piece.id(), location))
    }
}

struct Running {
    tx: MessageTx,
    worker: JoinHandle<()>,
    registrations: Vec<(Arc<dyn Vehicle>, ListenerId)>,
}

/// Enrichment engine over a fixed track and set of vehicles.
///
/// Distance units and fault handling are supplied by the injected
/// [`TransitionCostModel`] and [`ErrorSink`].
pub struct DistanceFilter {
    track: Arc<Track>,
    vehicles: Vec<Arc<dyn Vehicle>>,
    cost: Arc<dyn TransitionCostModel>,
    errors: Arc<dyn ErrorSink>,
    clock: Arc<dyn Clock>,
    config: FilterConfig,
    state: Arc<Mutex<FilterState>>,
    listener: Mutex<UpdateListener>,
    running: Mutex<Option<Running>>,
}

impl DistanceFilter {
    pub fn new(track: Arc<Track>, vehicles: Vec<Arc<dyn Vehicle>>) -> Self {
        Self {
            track,
            vehicles,
            cost: Arc::new(TableCostModel),
            errors: Arc::new(LogErrorSink),
            clock: Arc::new(SystemClock),
            config: FilterConfig::default(),
            state: Arc::new(Mutex::new(FilterState::default())),
            listener: Mutex::new(Arc::new(|_: VehicleMessage| {})),
            running: Mutex::new(None),
        }
    }

    pub fn with_cost_model(mut self, cost: Arc<dyn TransitionCostModel>) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: FilterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn track(&self) -> &Arc<Track> {
        &self.track
    }

    pub fn is_started(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Sets the single update listener. Ignored while the filter runs.
    pub fn on_update(&self, listener: UpdateListener) {
        let running = self.running.lock();
        if running.is_some() {
            tracing::debug!("update listener not replaced: filter is running");
            return;
        }
        *self.listener.lock() = listener;
    }

    pub fn start(&self) -> Result<(), FilterError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(FilterError::AlreadyStarted);
        }

        let (tx, rx) = channel();
        let engine = Engine {
            track: self.track.clone(),
            cost: self.cost.clone(),
            errors: self.errors.clone(),
            clock: self.clock.clone(),
            config: self.config,
            state: self.state.clone(),
            listener: self.listener.lock().clone(),
        };
        let worker = thread::spawn(move || engine.run(rx));

        let registrations = self
            .vehicles
            .iter()
            .map(|vehicle| {
                let tx = tx.clone();
                let id = vehicle.add_listener(Arc::new(move |message: &VehicleMessage| {
                    let _ = tx.send(message.clone());
                }));
                (vehicle.clone(), id)
            })
            .collect();

        *running = Some(Running { tx, worker, registrations });
        tracing::info!(vehicles = self.vehicles.len(), pieces = self.track.len(), "distance filter started");
        Ok(())
    }

    /// Deregisters the vehicle listeners and waits until every message queued
    /// so far has been processed.
    pub fn stop(&self) -> Result<(), FilterError> {
        self.begin_stop()?.wait();
        Ok(())
    }

    /// Deregisters the vehicle listeners and closes the queue without waiting
    /// for the worker. Async callers hand the returned [`Stopping`] to a
    /// blocking thread.
    pub fn begin_stop(&self) -> Result<Stopping, FilterError> {
        let Some(run) = self.running.lock().take() else {
            return Err(FilterError::NotStarted);
        };

        for (vehicle, id) in &run.registrations {
            vehicle.remove_listener(*id);
        }
        drop(run.registrations);
        drop(run.tx);
        Ok(Stopping { worker: run.worker })
    }

    /// Latest enriched snapshot of a vehicle.
    pub fn snapshot(&self, vehicle_id: &str) -> Option<PositionUpdate> {
        self.state.lock().store.get(vehicle_id).cloned()
    }

    pub fn known_vehicles(&self) -> Vec<String> {
        self.state.lock().store.keys().cloned().collect()
    }
}

/// A filter whose queue is closed but whose worker may still be draining it.
#[must_use = "the worker is only joined by `wait`"]
pub struct Stopping {
    worker: JoinHandle<()>,
}

impl Stopping {
    /// Blocks until every queued message has been processed.
    pub fn wait(self) {
        if self.worker.join().is_err() {
            tracing::error!("distance filter worker panicked");
        }
        tracing::info!("distance filter stopped");
    }
}

impl Drop for DistanceFilter {
    fn drop(&mut self) {
        if self.is_started() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::tests::loop_config;
    use model::{PieceConfig, PieceKind, TrackConfig, TransitionTable};
    use overdrive_link_core::{
        ConnectionState, IntersectionUpdate, Listener, ListenerRegistry, TransitionUpdate, TurnType, VehicleError,
    };
    use std::time::Duration;

    struct FakeVehicle {
        id: String,
        listeners: ListenerRegistry,
    }

    impl FakeVehicle {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self { id: id.into(), listeners: ListenerRegistry::new() })
        }

        fn emit(&self, message: impl Into<VehicleMessage>) {
            self.listeners.dispatch(&message.into());
        }

        fn report(&self, piece: u32, location: u32, offset: f32, speed: u16, at: OffsetDateTime) {
            self.emit(PositionUpdate::new(self.id.clone(), piece, location, offset, speed).at(at));
        }
    }

    #[async_trait::async_trait]
    impl Vehicle for FakeVehicle {
        fn id(&self) -> &str {
            &self.id
        }
        fn address(&self) -> &str {
            ""
        }
        fn name(&self) -> &str {
            ""
        }
        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
        async fn connect(&self) -> Result<(), VehicleError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), VehicleError> {
            Ok(())
        }
        fn set_speed(&self, _: u16, _: Option<u16>) -> Result<(), VehicleError> {
            Ok(())
        }
        fn set_offset(&self, _: f32) -> Result<(), VehicleError> {
            Ok(())
        }
        fn change_lane(&self, _: f32, _: Option<u16>, _: Option<u16>) -> Result<(), VehicleError> {
            Ok(())
        }
        fn turn(&self, _: TurnType) -> Result<(), VehicleError> {
            Ok(())
        }
        fn set_sdk_mode(&self, _: bool) -> Result<(), VehicleError> {
            Ok(())
        }
        fn add_listener(&self, listener: Listener) -> ListenerId {
            self.listeners.add(listener)
        }
        fn remove_listener(&self, id: ListenerId) -> bool {
            self.listeners.remove(id)
        }
    }

    struct FixedClock(Mutex<OffsetDateTime>);

    impl FixedClock {
        fn new(at: OffsetDateTime) -> Arc<Self> {
            Arc::new(Self(Mutex::new(at)))
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> OffsetDateTime {
            *self.0.lock()
        }
    }

    fn t0() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::days(20_000)
    }

    /// One straight piece, lane 0 markers every 250 mm, lane 1 with three markers.
    fn straight_loop() -> Arc<Track> {
        Arc::new(
            Track::new(TrackConfig {
                pieces: vec![PieceConfig {
                    id: 40,
                    kind: PieceKind::Straight,
                    lanes: vec![vec![0, 1, 2, 3, 4, 5, 6, 7], vec![10, 11, 12]],
                }],
                transitions: TransitionTable { straight: vec![250.0], ..Default::default() },
            })
            .unwrap(),
        )
    }

    struct Harness {
        filter: DistanceFilter,
        vehicles: Vec<Arc<FakeVehicle>>,
        rx: crossbeam_channel::Receiver<VehicleMessage>,
        errors: Arc<CountingErrorSink>,
    }

    impl Harness {
        fn new(track: Arc<Track>, ids: &[&str]) -> Self {
            let vehicles: Vec<Arc<FakeVehicle>> = ids.iter().map(|id| FakeVehicle::new(id)).collect();
            let errors = Arc::new(CountingErrorSink::new());
            let filter = DistanceFilter::new(track, vehicles.iter().map(|v| v.clone() as Arc<dyn Vehicle>).collect())
                .with_error_sink(errors.clone())
                .with_clock(FixedClock::new(t0()));
            let (tx, rx) = crossbeam_channel::unbounded();
            filter.on_update(Arc::new(move |m: VehicleMessage| {
                let _ = tx.send(m);
            }));
            filter.start().unwrap();
            Self { filter, vehicles, rx, errors }
        }

        fn next(&self) -> VehicleMessage {
            self.rx.recv_timeout(Duration::from_secs(2)).expect("no enriched message")
        }

        fn next_position(&self) -> PositionUpdate {
            self.next().as_position().cloned().expect("expected a position update")
        }
    }

    #[test]
    fn test_lifecycle_errors() {
        let filter = DistanceFilter::new(straight_loop(), Vec::new());
        assert_eq!(filter.stop(), Err(FilterError::NotStarted));
        filter.start().unwrap();
        assert_eq!(filter.start(), Err(FilterError::AlreadyStarted));
        filter.stop().unwrap();
        assert_eq!(filter.stop(), Err(FilterError::NotStarted));
        filter.start().unwrap();
        assert!(filter.is_started());
    }

    #[test]
    fn test_two_stationary_vehicles_on_straight() {
        let h = Harness::new(straight_loop(), &["lead", "trail"]);
        let (lead, trail) = (&h.vehicles[0], &h.vehicles[1]);

        lead.report(40, 4, 0.0, 0, t0());
        let first = h.next_position();
        assert_eq!(first.distances.map(|d| d.len()), Some(0));

        trail.report(40, 0, 0.0, 0, t0());
        let m = h.next_position();
        assert_eq!((m.lane, m.position), (Some(0), Some(0)));
        let d = m.distance_to("lead").unwrap();
        assert_eq!(d.horizontal, 1000.0 - DEFAULT_VEHICLE_LENGTH_MM);
        assert_eq!(d.vertical, 0.0);
        assert_eq!(d.delta, None);

        trail.report(40, 0, 0.0, 0, t0());
        let m = h.next_position();
        let d = m.distance_to("lead").unwrap();
        assert_eq!(d.horizontal, 1000.0 - DEFAULT_VEHICLE_LENGTH_MM);
        assert_eq!(d.delta, Some(0.0));
    }

    #[test]
    fn test_every_output_has_one_distance_per_other_vehicle() {
        let h = Harness::new(straight_loop(), &["a", "b", "c"]);
        let reports = [(0, 1), (1, 3), (2, 5), (0, 2), (1, 4), (2, 6), (0, 3)];
        let mut known = std::collections::BTreeSet::new();
        for (who, location) in reports {
            let v = &h.vehicles[who];
            v.report(40, location, 0.0, 0, t0());
            known.insert(v.id.clone());
            let m = h.next_position();
            let distances = m.distances.unwrap();
            assert_eq!(distances.len(), known.len() - 1);
            assert!(distances.iter().all(|d| d.vehicle != v.id));
        }
    }

    #[test]
    fn test_delta_tracks_change_of_horizontal() {
        let h = Harness::new(straight_loop(), &["a", "b"]);
        let (a, b) = (&h.vehicles[0], &h.vehicles[1]);

        b.report(40, 5, 0.0, 0, t0());
        h.next();
        a.report(40, 1, 0.0, 0, t0());
        let first = h.next_position().distance_to("b").unwrap().clone();
        assert_eq!(first.delta, None);

        b.report(40, 6, 0.0, 0, t0());
        h.next();
        a.report(40, 2, 0.0, 0, t0());
        let second = h.next_position().distance_to("b").unwrap().clone();
        assert_eq!(second.horizontal, first.horizontal);
        assert_eq!(second.delta, Some(0.0));

        b.report(40, 7, 0.0, 0, t0());
        h.next();
        a.report(40, 2, 0.0, 0, t0());
        let third = h.next_position().distance_to("b").unwrap().clone();
        assert_eq!(third.horizontal - second.horizontal, 250.0);
        assert_eq!(third.delta, Some(third.horizontal - second.horizontal));
    }

    #[test]
    fn test_other_vehicle_travel_since_report_is_added() {
        let h = Harness::new(straight_loop(), &["a", "b"]);
        // b reported 0.5 s before the fixed clock, driving 400 mm/s
        h.vehicles[1].report(40, 2, 0.0, 400, t0() - time::Duration::milliseconds(500));
        h.next();
        h.vehicles[0].report(40, 0, 0.0, 0, t0());
        let d = h.next_position().distance_to("b").unwrap().clone();
        assert!((d.horizontal - (500.0 + 200.0 - DEFAULT_VEHICLE_LENGTH_MM)).abs() < 1e-9);
    }

    #[test]
    fn test_horizontal_is_not_symmetric() {
        let h = Harness::new(straight_loop(), &["a", "b"]);
        h.vehicles[0].report(40, 1, 10.0, 0, t0());
        h.next();
        h.vehicles[1].report(40, 3, -5.0, 0, t0());
        let b_to_a = h.next_position().distance_to("a").unwrap().clone();
        h.vehicles[0].report(40, 1, 10.0, 0, t0());
        let a_to_b = h.next_position().distance_to("b").unwrap().clone();

        assert_eq!(a_to_b.horizontal, 500.0 - DEFAULT_VEHICLE_LENGTH_MM);
        // b has to go around the loop (8 markers) to reach a
        assert_eq!(b_to_a.horizontal, 6.0 * 250.0 - DEFAULT_VEHICLE_LENGTH_MM);
        assert_eq!(a_to_b.vertical, 15.0);
        assert_eq!(b_to_a.vertical, 15.0);
    }

    #[test]
    fn test_projection_onto_shorter_lane_uses_last_marker() {
        let h = Harness::new(Arc::new(Track::new(loop_config()).unwrap()), &["outer", "inner"]);
        // outer vehicle on curve lane 0 at its 4th marker
        h.vehicles[0].report(18, 3, 0.0, 0, t0());
        h.next();
        // inner vehicle on the start piece, lane 1; the curve's lane 1 only has
        // two markers, so the target becomes (18, 5)
        h.vehicles[1].report(33, 5, 0.0, 0, t0());
        let d = h.next_position().distance_to("outer").unwrap().clone();
        // (33,5) -> (18,4) start step 100, (18,4) -> (18,5) curve lane 1 step 80
        assert_eq!(d.horizontal, 180.0 - DEFAULT_VEHICLE_LENGTH_MM);
    }

    #[test]
    fn test_malformed_update_is_isolated() {
        let h = Harness::new(straight_loop(), &["a", "b"]);
        h.vehicles[0].report(99, 0, 0.0, 0, t0());
        h.vehicles[1].report(40, 2, 0.0, 0, t0());

        let m = h.next_position();
        assert_eq!(m.vehicle_id, "b");
        assert_eq!(m.distances.as_ref().map(Vec::len), Some(0));
        assert_eq!(h.errors.count(), 1);
        let (vehicle, error) = h.errors.last().unwrap();
        assert_eq!(vehicle, "a");
        assert!(error.contains("unknown piece 99"));
        assert!(h.filter.snapshot("a").is_none());
        assert_eq!(h.filter.known_vehicles(), vec!["b".to_string()]);
    }

    #[test]
    fn test_failed_walk_leaves_state_untouched() {
        // no curve length configured: any walk across the curve faults
        let track = Track::new(TrackConfig {
            pieces: vec![
                PieceConfig { id: 40, kind: PieceKind::Straight, lanes: vec![vec![0, 1, 2]] },
                PieceConfig { id: 18, kind: PieceKind::Curve, lanes: vec![vec![0, 1, 2]] },
            ],
            transitions: TransitionTable { straight: vec![100.0], ..Default::default() },
        })
        .unwrap();
        let h = Harness::new(Arc::new(track), &["a", "b"]);

        h.vehicles[0].report(40, 2, 0.0, 0, t0());
        h.next_position();
        h.vehicles[1].report(40, 0, 0.0, 0, t0());
        let first = h.next_position().distance_to("a").unwrap().clone();
        assert_eq!(first.horizontal, 200.0 - DEFAULT_VEHICLE_LENGTH_MM);
        let before = h.filter.snapshot("a").unwrap();

        h.vehicles[0].report(18, 1, 0.0, 0, t0());
        h.vehicles[1].report(40, 0, 0.0, 0, t0());
        let m = h.next_position();
        assert_eq!(m.vehicle_id, "b");
        let d = m.distance_to("a").unwrap();
        assert_eq!(d.horizontal, first.horizontal);
        assert_eq!(d.delta, Some(0.0));

        assert_eq!(h.errors.count(), 1);
        assert!(h.errors.last().unwrap().1.contains("no transition length"));
        assert_eq!(h.filter.snapshot("a"), Some(before));
    }

    #[test]
    fn test_non_position_messages_pass_through() {
        let h = Harness::new(straight_loop(), &["a"]);
        let transition = VehicleMessage::Transition(TransitionUpdate {
            vehicle_id: "a".into(),
            timestamp: t0(),
            piece: 40,
            previous_piece: 18,
            offset: -23.0,
            last_recv_lane_change: 0,
            last_exec_lane_change: 0,
            last_desired_horizontal_speed: 0,
            last_desired_speed: 300,
            uphill_counter: 0,
            downhill_counter: 0,
            left_wheel_distance_cm: 12,
            right_wheel_distance_cm: 12,
        });
        h.vehicles[0].emit(transition.clone());
        assert_eq!(h.next(), transition);

        let msg = VehicleMessage::Intersection(IntersectionUpdate {
            vehicle_id: "a".into(),
            timestamp: t0(),
            piece: 10,
            offset: 0.0,
            intersection_code: 1,
            is_exiting: false,
            mm_since_last_transition_bar: 0,
            mm_since_last_intersection_code: 0,
        });
        h.vehicles[0].emit(msg.clone());
        assert_eq!(h.next(), msg);
        assert!(h.filter.known_vehicles().is_empty());
    }

    #[test]
    fn test_on_update_ignored_while_started() {
        let h = Harness::new(straight_loop(), &["a"]);
        let (tx, rx) = crossbeam_channel::unbounded();
        h.filter.on_update(Arc::new(move |m: VehicleMessage| {
            let _ = tx.send(m);
        }));
        h.vehicles[0].report(40, 0, 0.0, 0, t0());
        h.next();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_begin_stop_closes_queue_before_wait() {
        let h = Harness::new(straight_loop(), &["a"]);
        h.vehicles[0].report(40, 1, 0.0, 0, t0());
        let stopping = h.filter.begin_stop().unwrap();
        assert!(!h.filter.is_started());
        assert!(h.vehicles[0].listeners.is_empty());
        assert!(matches!(h.filter.begin_stop(), Err(FilterError::NotStarted)));

        stopping.wait();
        assert_eq!(h.rx.try_iter().count(), 1);
        h.filter.start().unwrap();
    }

    #[test]
    fn test_stop_drains_and_deregisters() {
        let h = Harness::new(straight_loop(), &["a"]);
        for location in 0..5 {
            h.vehicles[0].report(40, location, 0.0, 0, t0());
        }
        h.filter.stop().unwrap();
        assert_eq!(h.rx.try_iter().count(), 5);
        assert!(h.vehicles[0].listeners.is_empty());

        h.vehicles[0].report(40, 6, 0.0, 0, t0());
        assert!(h.rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(h.filter.snapshot("a").and_then(|m| m.position), Some(4));
    }
}
