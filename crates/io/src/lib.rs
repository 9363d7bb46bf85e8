use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::{fs::File, path::Path, sync::Arc};
use time::format_description::well_known::Rfc3339;

use model::*;
use overdrive_link_core::VehicleMessage;

pub fn read_track<R: Read>(rdr: R) -> Result<TrackConfig> {
    let track: TrackConfig = serde_json::from_reader(rdr).context("parse track description")?;
    if track.pieces.is_empty() {
        anyhow::bail!("track description has no pieces");
    }
    Ok(track)
}

pub fn load_track(path: &Path) -> Result<TrackConfig> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    read_track(BufReader::new(f)).with_context(|| format!("load track {}", path.display()))
}

pub fn load_setup(path: &Path) -> Result<Setup> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let setup: Setup =
        serde_json::from_reader(BufReader::new(f)).with_context(|| format!("parse setup {}", path.display()))?;
    if setup.track.pieces.is_empty() {
        anyhow::bail!("setup {} has no track pieces", path.display());
    }
    Ok(setup)
}

pub fn import_ndjson(path: &Path) -> Result<Vec<VehicleMessage>> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let rdr = BufReader::new(f);
    let mut messages = vec![];
    for (n, line) in rdr.lines().enumerate() {
        let s = line?;
        if s.trim().is_empty() {
            continue;
        }
        let m: VehicleMessage = serde_json::from_str(&s).with_context(|| format!("line {}", n + 1))?;
        messages.push(m);
    }
    Ok(messages)
}

pub fn export_ndjson(messages: &[VehicleMessage], path: &Path) -> Result<()> {
    let f = File::create(path)?;
    let mut w = BufWriter::new(f);
    for m in messages {
        let s = serde_json::to_string(m)?;
        writeln!(w, "{}", s)?;
    }
    w.flush()?;
    Ok(())
}

/// Streams every message it receives as one JSON line.
pub struct NdjsonSink<W: Write + Send> {
    w: Mutex<BufWriter<W>>,
}

impl<W: Write + Send + 'static> NdjsonSink<W> {
    pub fn new(w: W) -> Self {
        Self { w: Mutex::new(BufWriter::new(w)) }
    }

    pub fn write(&self, m: &VehicleMessage) -> Result<()> {
        let s = serde_json::to_string(m)?;
        let mut w = self.w.lock();
        writeln!(w, "{}", s)?;
        w.flush()?;
        Ok(())
    }

    /// Adapts the sink into an update listener; write failures are logged.
    pub fn into_listener(self) -> Arc<dyn Fn(VehicleMessage) + Send + Sync> {
        Arc::new(move |m: VehicleMessage| {
            if let Err(e) = self.write(&m) {
                tracing::warn!(error = %e, "could not write message");
            }
        })
    }

    pub fn into_inner(self) -> Result<W> {
        self.w.into_inner().into_inner().map_err(|e| anyhow::anyhow!("flush sink: {}", e.error()))
    }
}

/// One row per distance record of every enriched position update.
pub fn export_distances_csv(messages: &[VehicleMessage], path: &Path) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    for m in messages {
        let Some(p) = m.as_position() else { continue };
        let Some(distances) = &p.distances else { continue };
        let timestamp = p.timestamp.format(&Rfc3339)?;
        for d in distances {
            w.serialize(DistanceRow {
                vehicle: p.vehicle_id.clone(),
                timestamp: timestamp.clone(),
                piece: p.piece,
                location: p.location,
                lane: p.lane,
                position: p.position,
                offset: p.offset,
                speed: p.speed,
                other: d.vehicle.clone(),
                vertical: d.vertical,
                horizontal: d.horizontal,
                delta: d.delta,
            })?;
        }
    }
    w.flush()?;
    Ok(())
}

pub fn export_setup(setup: &Setup, path: &Path) -> Result<()> {
    let f = File::create(path)?;
    let mut w = BufWriter::new(f);
    serde_json::to_writer_pretty(&mut w, setup)?;
    w.flush()?;
    Ok(())
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct DistanceRow {
    vehicle: String,
    timestamp: String,
    piece: u32,
    location: u32,
    lane: Option<usize>,
    position: Option<usize>,
    offset: f32,
    speed: u16,
    other: String,
    vertical: f64,
    horizontal: f64,
    delta: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use overdrive_link_core::{Distance, PositionUpdate};
    use std::path::PathBuf;

    fn temp(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("overdrive-io-{}-{}", std::process::id(), name))
    }

    fn enriched(id: &str, other: &str, horizontal: f64, delta: Option<f64>) -> VehicleMessage {
        let mut p = PositionUpdate::new(id, 40, 2, 0.0, 300);
        p.lane = Some(0);
        p.position = Some(2);
        p.distances = Some(vec![Distance { vehicle: other.into(), vertical: 1.5, horizontal, delta }]);
        p.into()
    }

    #[test]
    fn test_read_track() {
        let json = r#"{"pieces":[{"id":40,"kind":"Straight","lanes":[[0,1,2]]}],"transitions":{"straight":[250.0]}}"#;
        let track = read_track(json.as_bytes()).unwrap();
        assert_eq!(track.pieces[0].id, 40);
        assert!(read_track(r#"{"pieces":[]}"#.as_bytes()).is_err());
        assert!(read_track("not json".as_bytes()).is_err());
    }

    #[test]
    fn test_load_setup_roundtrip() {
        let json = r#"{"pieces":[{"id":40,"kind":"Straight","lanes":[[0,1,2]]}]}"#;
        let mut setup = Setup::new(read_track(json.as_bytes()).unwrap());
        setup.vehicles.push(VehicleConfig {
            uuid: "ed0c94216553".into(),
            address: String::new(),
            name: "skull".into(),
            offset: 23.0,
        });
        let path = temp("setup.json");
        export_setup(&setup, &path).unwrap();
        let back = load_setup(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(back, setup);
        assert!(load_setup(&temp("missing.json")).is_err());
    }

    #[test]
    fn test_ndjson_roundtrip() {
        let messages = vec![enriched("a", "b", 120.0, None), enriched("b", "a", 300.0, Some(-2.0))];
        let path = temp("log.ndjson");
        export_ndjson(&messages, &path).unwrap();
        let back = import_ndjson(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(back, messages);
    }

    #[test]
    fn test_ndjson_sink_writes_lines() {
        let sink = NdjsonSink::new(Vec::new());
        sink.write(&enriched("a", "b", 10.0, None)).unwrap();
        sink.write(&enriched("a", "b", 12.0, Some(2.0))).unwrap();
        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"delta\":2.0"));
    }

    #[test]
    fn test_export_distances_csv() {
        let messages = vec![
            enriched("a", "b", 120.0, None),
            PositionUpdate::new("c", 40, 0, 0.0, 0).into(), // not enriched
            enriched("b", "a", 300.0, Some(-2.0)),
        ];
        let path = temp("distances.csv");
        export_distances_csv(&messages, &path).unwrap();
        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<DistanceRow> = rdr.deserialize().map(|r| r.unwrap()).collect();
        std::fs::remove_file(&path).ok();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].other, "b");
        assert_eq!(rows[0].delta, None);
        assert_eq!(rows[1].delta, Some(-2.0));
        assert_eq!(rows[1].lane, Some(0));
    }
}
