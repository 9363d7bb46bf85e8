use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum PieceKind {
    Start,
    Finish,
    Straight,
    Curve,
}

impl PieceKind {
    pub fn label(&self) -> &'static str {
        match self {
            PieceKind::Start => "Start",
            PieceKind::Finish => "Finish",
            PieceKind::Straight => "Straight",
            PieceKind::Curve => "Curve",
        }
    }
}

/// One track piece as authored: its id, its kind and one marker sequence per lane.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PieceConfig {
    pub id: u32,
    pub kind: PieceKind,
    #[serde(default)]
    pub lanes: Vec<Vec<u32>>,
}

/// Physical length (mm) of one step between adjacent markers, per piece kind.
///
/// Each row is indexed by lane. Lanes past the end of a row reuse the last
/// entry, so a single value covers every lane of a straight.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct TransitionTable {
    #[serde(default)]
    pub start: Vec<f64>,
    #[serde(default)]
    pub finish: Vec<f64>,
    #[serde(default)]
    pub straight: Vec<f64>,
    #[serde(default)]
    pub curve: Vec<f64>,
}

impl TransitionTable {
    pub fn row(&self, kind: PieceKind) -> &[f64] {
        match kind {
            PieceKind::Start => &self.start,
            PieceKind::Finish => &self.finish,
            PieceKind::Straight => &self.straight,
            PieceKind::Curve => &self.curve,
        }
    }

    pub fn length(&self, kind: PieceKind, lane: usize) -> Option<f64> {
        let row = self.row(kind);
        row.get(lane).or_else(|| row.last()).copied()
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TrackConfig {
    #[serde(default)]
    pub pieces: Vec<PieceConfig>,
    #[serde(default)]
    pub transitions: TransitionTable,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct VehicleConfig {
    pub uuid: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub name: String,
    /// Lateral offset (mm) the vehicle is placed on at startup.
    #[serde(default)]
    pub offset: f32,
}

/// Identity of one physical installation; published as a status record.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Setup {
    #[serde(with = "uuid::serde::simple")]
    pub uuid: Uuid,
    #[serde(default)]
    pub vehicles: Vec<VehicleConfig>,
    pub track: TrackConfig,
    #[serde(default)]
    pub online: bool,
}

impl Setup {
    pub fn new(track: TrackConfig) -> Self {
        Self { uuid: Uuid::new_v4(), vehicles: Vec::new(), track, online: false }
    }

    pub fn vehicle(&self, uuid: &str) -> Option<&VehicleConfig> {
        self.vehicles.iter().find(|v| v.uuid == uuid)
    }
}
