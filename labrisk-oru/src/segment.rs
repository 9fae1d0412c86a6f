//! Line-oriented ORU segment parsing and patient batch reconstruction.

use labrisk_core::{ObservationResult, PatientBatch, PatientDetails};
use tracing::{debug, trace};

/// A single `|`-delimited segment. Field 0 is the segment tag; missing fields read as `""`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    fields: Vec<&'a str>,
}

impl<'a> Segment<'a> {
    pub fn tag(&self) -> &'a str {
        self.field(0)
    }

    pub fn field(&self, index: usize) -> &'a str {
        self.fields.get(index).copied().unwrap_or_default()
    }
}

pub fn parse_segment(line: &str) -> Segment<'_> {
    Segment {
        fields: line.split('|').collect(),
    }
}

/// Split on `\r\n`, `\n` or a lone `\r`.
pub fn split_segments(text: &str) -> impl Iterator<Item = &str> {
    text.lines().flat_map(|line| line.split('\r'))
}

/// Rebuild patient batches from raw ORU text. Never fails: unknown segments are ignored
/// and short segments default their missing fields to empty strings.
pub fn parse_batches(text: &str) -> Vec<PatientBatch> {
    split_segments(text)
        .map(parse_segment)
        .fold(ParseState::default(), ParseState::step)
        .finish()
}

/// Accumulator threaded through the fold. Each step consumes the state and returns the next.
#[derive(Debug, Default)]
struct ParseState {
    patient: PatientDetails,
    results: Vec<ObservationResult>,
    closed: Vec<PatientBatch>,
}

impl ParseState {
    fn step(mut self, segment: Segment<'_>) -> Self {
        match segment.tag() {
            "PID" => self.handle_patient(&segment),
            "OBX" => self.handle_observation(&segment),
            "" => {}
            other => trace!(tag = other, "ignoring segment"),
        }
        self
    }

    fn handle_patient(&mut self, segment: &Segment<'_>) {
        let incoming = patient_details(segment);

        if self.patient.patient_id.is_empty() {
            self.drop_orphans();
        } else if self.patient.patient_id != incoming.patient_id {
            self.close_batch();
        }

        // Same id: demographics are replaced, the batch stays open.
        self.patient = incoming;
    }

    fn handle_observation(&mut self, segment: &Segment<'_>) {
        self.results.push(ObservationResult {
            test_name: segment.field(3).to_string(),
            result: segment.field(5).to_string(),
            units: segment.field(6).to_string(),
            reference_range: segment.field(7).to_string(),
            flag: segment.field(8).to_string(),
        });
    }

    fn close_batch(&mut self) {
        let patient_details = std::mem::take(&mut self.patient);
        let results = std::mem::take(&mut self.results);
        debug!(
            patient_id = %patient_details.patient_id,
            results = results.len(),
            "closed patient batch"
        );
        self.closed.push(PatientBatch {
            patient_details,
            results,
        });
    }

    fn drop_orphans(&mut self) {
        if !self.results.is_empty() {
            debug!(
                dropped = self.results.len(),
                "dropping OBX segments without an identified patient"
            );
            self.results.clear();
        }
    }

    fn finish(mut self) -> Vec<PatientBatch> {
        if self.patient.patient_id.is_empty() {
            self.drop_orphans();
        } else {
            self.close_batch();
        }
        self.closed
    }
}

/// Reads PID-3/5/7/8. Senders that leave PID-3 empty and put the identifier in PID-2 use a
/// layout shifted one field to the left, so name, birth date and sex move with it.
fn patient_details(segment: &Segment<'_>) -> PatientDetails {
    let shift = usize::from(segment.field(3).is_empty() && !segment.field(2).is_empty());
    PatientDetails {
        patient_id: segment.field(3 - shift).to_string(),
        patient_name: segment.field(5 - shift).to_string(),
        dob: segment.field(7 - shift).to_string(),
        gender: segment.field(8 - shift).to_string(),
    }
}
