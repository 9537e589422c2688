use std::fs::File;
use std::io::{self, Write};
use std::sync::mpsc;
use std::thread;

use crate::domain::status_store::history::HistoryRecord;

/// Pluggable back end for history records. The store keeps the in-memory
/// authoritative copy; the backend only ever receives appends.
pub trait HistoryBackend: std::fmt::Debug + Send + Sync {
    /// Append one record. Must not block the caller for long; implementations
    /// hand the record off to their own writer.
    fn append(&self, record: &HistoryRecord);

    /// Flush any buffered output.
    fn flush(&self);
}

/// Messages sent from the store to the writer thread.
enum WriterMessage {
    Append(Box<HistoryRecord>),
    Flush,
    Shutdown,
}

/// CSV append log, written by a background thread fed over a channel so that
/// store mutations never wait on disk.
#[derive(Debug)]
pub struct CsvHistoryBackend {
    sender: mpsc::Sender<WriterMessage>,
}

const CSV_HEADERS: [&str; 14] = [
    "Step",
    "Process",
    "Experiment",
    "Fct",
    "Device",
    "Containers",
    "StartS",
    "FinishS",
    "Status",
    "Value",
    "Origin",
    "Destination",
    "Lidded",
    "IsSimulation",
];

impl CsvHistoryBackend {
    /// Spawns the background writer thread. `filename = None` writes to stdout.
    pub fn init(filename: Option<String>) -> CsvHistoryBackend {
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            Self::worker_loop(rx, filename);
        });

        CsvHistoryBackend { sender: tx }
    }

    fn worker_loop(rx: mpsc::Receiver<WriterMessage>, filename: Option<String>) {
        let writer: Box<dyn Write> = match filename {
            Some(f) => match File::create(&f) {
                Ok(file) => Box::new(file),
                Err(e) => {
                    log::error!("History backend could not create '{}': {}. Falling back to stdout.", f, e);
                    Box::new(io::stdout())
                }
            },
            None => Box::new(io::stdout()),
        };

        let mut csv_wtr = csv::WriterBuilder::new().delimiter(b';').from_writer(writer);

        if let Err(e) = csv_wtr.write_record(CSV_HEADERS) {
            log::error!("History backend failed to write headers: {}", e);
        }

        for msg in rx {
            match msg {
                WriterMessage::Append(record) => {
                    let row = Self::record_to_row(&record);
                    if let Err(e) = csv_wtr.write_record(&row) {
                        log::error!("History backend failed to write record for step {}: {}", record.step, e);
                    }
                }
                WriterMessage::Flush => {
                    let _ = csv_wtr.flush();
                }
                WriterMessage::Shutdown => {
                    let _ = csv_wtr.flush();
                    break;
                }
            }
        }
    }

    fn record_to_row(record: &HistoryRecord) -> Vec<String> {
        let containers = record.containers.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(",");
        let value = record.value.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "NA".to_string());
        let (origin, destination, lidded) = match &record.movement {
            Some(m) => (m.origin.to_string(), m.destination.to_string(), m.lidded.to_string()),
            None => ("NA".to_string(), "NA".to_string(), "NA".to_string()),
        };

        vec![
            record.step.to_string(),
            record.process.to_string(),
            record.experiment.to_string(),
            record.fct.clone(),
            record.device.to_string(),
            containers,
            record.start_s.to_string(),
            record.finish_s.to_string(),
            record.status.to_string(),
            value,
            origin,
            destination,
            lidded,
            record.is_simulation.to_string(),
        ]
    }
}

impl HistoryBackend for CsvHistoryBackend {
    fn append(&self, record: &HistoryRecord) {
        // Ignore send errors (writer thread gone) to never fail a commit on
        // the persistence path; the in-memory copy stays authoritative.
        let _ = self.sender.send(WriterMessage::Append(Box::new(record.clone())));
    }

    fn flush(&self) {
        let _ = self.sender.send(WriterMessage::Flush);
    }
}

impl Drop for CsvHistoryBackend {
    fn drop(&mut self) {
        let _ = self.sender.send(WriterMessage::Shutdown);
    }
}
