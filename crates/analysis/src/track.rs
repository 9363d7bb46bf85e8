//! Track geometry: a closed loop of pieces, each carrying one marker sequence
//! per lane.

use std::collections::HashMap;

use model::{PieceKind, TrackConfig, TransitionTable};
use serde::{Deserialize, Serialize};

/// A marker on the track, addressed by its piece and its raw location value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackPoint {
    pub piece: u32,
    pub location: u32,
}

impl TrackPoint {
    pub fn new(piece: u32, location: u32) -> Self {
        Self { piece, location }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TrackError {
    #[error("track has no pieces")]
    Empty,
    #[error("piece {0} appears more than once")]
    DuplicatePiece(u32),
    #[error("piece {0} has no lanes")]
    NoLanes(u32),
    #[error("lane {lane} of piece {piece} has no markers")]
    EmptyLane { piece: u32, lane: usize },
    #[error("unknown piece {0}")]
    UnknownPiece(u32),
    #[error("piece {piece} has no lane {lane}")]
    UnknownLane { piece: u32, lane: usize },
    #[error("location {location} is not on any lane of piece {piece}")]
    UnknownLocation { piece: u32, location: u32 },
    #[error("location {location} is not on lane {lane} of piece {piece}")]
    NotOnLane { piece: u32, lane: usize, location: u32 },
    #[error("no transition length configured for {kind:?} lane {lane}")]
    MissingTransitionLength { kind: PieceKind, lane: usize },
    #[error("{to:?} is not reachable from {from:?} on lane {lane}")]
    Unreachable { lane: usize, from: TrackPoint, to: TrackPoint },
}

#[derive(Debug, Clone)]
pub struct Piece {
    id: u32,
    kind: PieceKind,
    lanes: Vec<Vec<u32>>,
}

impl Piece {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> PieceKind {
        self.kind
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane(&self, lane: usize) -> Result<&[u32], TrackError> {
        self.lanes
            .get(lane)
            .map(Vec::as_slice)
            .ok_or(TrackError::UnknownLane { piece: self.id, lane })
    }

    /// Ordinal of `location` within the marker sequence of `lane`.
    pub fn location_index(&self, lane: usize, location: u32) -> Result<usize, TrackError> {
        self.lane(lane)?
            .iter()
            .position(|l| *l == location)
            .ok_or(TrackError::NotOnLane { piece: self.id, lane, location })
    }

    /// First lane whose markers contain `location`.
    pub fn find_lane(&self, location: u32) -> Option<usize> {
        self.lanes.iter().position(|markers| markers.contains(&location))
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pieces: Vec<Piece>,
    index: HashMap<u32, usize>,
    transitions: TransitionTable,
}

impl Track {
    pub fn new(config: TrackConfig) -> Result<Self, TrackError> {
        if config.pieces.is_empty() {
            return Err(TrackError::Empty);
        }
        let mut index = HashMap::with_capacity(config.pieces.len());
        let mut pieces = Vec::with_capacity(config.pieces.len());
        for (i, p) in config.pieces.into_iter().enumerate() {
            if index.insert(p.id, i).is_some() {
                return Err(TrackError::DuplicatePiece(p.id));
            }
            if p.lanes.is_empty() {
                return Err(TrackError::NoLanes(p.id));
            }
            if let Some(lane) = p.lanes.iter().position(Vec::is_empty) {
                return Err(TrackError::EmptyLane { piece: p.id, lane });
            }
            pieces.push(Piece { id: p.id, kind: p.kind, lanes: p.lanes });
        }
        Ok(Self { pieces, index, transitions: config.transitions })
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn find_piece(&self, id: u32) -> Result<&Piece, TrackError> {
        self.slot(id).map(|i| &self.pieces[i])
    }

    pub fn find_lane(&self, piece: u32, location: u32) -> Result<usize, TrackError> {
        self.find_piece(piece)?
            .find_lane(location)
            .ok_or(TrackError::UnknownLocation { piece, location })
    }

    /// The piece following `id` in travel direction; the last piece wraps to the first.
    pub fn successor(&self, id: u32) -> Result<&Piece, TrackError> {
        let i = self.slot(id)?;
        Ok(&self.pieces[(i + 1) % self.pieces.len()])
    }

    pub fn each_piece(&self, mut visit: impl FnMut(&Piece)) {
        for piece in &self.pieces {
            visit(piece);
        }
    }

    pub fn transition_length(&self, kind: PieceKind, lane: usize) -> Result<f64, TrackError> {
        self.transitions
            .length(kind, lane)
            .ok_or(TrackError::MissingTransitionLength { kind, lane })
    }

    /// Walks `lane` from `from` to `to` in travel direction and calls `visit`
    /// once per pair of adjacent markers crossed, including the step from the
    /// last marker of a piece onto the first marker of its successor.
    ///
    /// Nothing is visited when `from == to`. A target behind `from` is reached
    /// by going once around the loop.
    pub fn each_transition<F, E>(&self, lane: usize, from: TrackPoint, to: TrackPoint, mut visit: F) -> Result<(), E>
    where
        F: FnMut(TrackPoint, TrackPoint) -> Result<(), E>,
        E: From<TrackError>,
    {
        let mut slot = self.slot(from.piece)?;
        let mut pos = self.pieces[slot].location_index(lane, from.location)?;
        self.find_piece(to.piece)?.location_index(lane, to.location)?;

        // one full lap visits every marker of the lane once
        let mut budget = self.lane_length(lane)?;
        let mut current = from;
        while current != to {
            if budget == 0 {
                return Err(TrackError::Unreachable { lane, from, to }.into());
            }
            budget -= 1;

            let markers = self.pieces[slot].lane(lane)?;
            if pos + 1 < markers.len() {
                pos += 1;
            } else {
                slot = (slot + 1) % self.pieces.len();
                pos = 0;
            }
            let piece = &self.pieces[slot];
            let next = TrackPoint::new(piece.id, piece.lane(lane)?[pos]);
            visit(current, next)?;
            current = next;
        }
        Ok(())
    }

    /// Number of markers of `lane` between the first marker of the first piece
    /// and `point`.
    pub fn absolute_position(&self, lane: usize, point: TrackPoint) -> Result<usize, TrackError> {
        let slot = self.slot(point.piece)?;
        let mut before = 0;
        for piece in &self.pieces[..slot] {
            before += piece.lane(lane)?.len();
        }
        Ok(before + self.pieces[slot].location_index(lane, point.location)?)
    }

    fn lane_length(&self, lane: usize) -> Result<usize, TrackError> {
        self.pieces.iter().map(|p| p.lane(lane).map(<[u32]>::len)).sum()
    }

    fn slot(&self, id: u32) -> Result<usize, TrackError> {
        self.index.get(&id).copied().ok_or(TrackError::UnknownPiece(id))
    }
}
