//! CSV export for plant step records.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::plant::StepOutput;

/// Column header for CSV telemetry export, matching the original
/// BessData.csv layout: setpoints, then the physical view with the
/// capability bounds, then the measured view.
const HEADER: &str = "time_s,set_p_mw,set_q_mvar,\
                      phys_p_mw,phys_q_mvar,phys_pf,phys_v_pu,phys_f_hz,phys_i_ka,\
                      max_q_mvar,min_q_mvar,\
                      meas_p_mw,meas_q_mvar,meas_pf,meas_v_pu,meas_f_hz,meas_i_ka";

/// Streaming CSV sink for per-tick records.
///
/// The real-time loop appends one row per tick; batch export goes
/// through the same formatting so both paths produce identical files.
pub struct CsvSink<W: Write> {
    wtr: csv::Writer<W>,
}

impl<W: Write> CsvSink<W> {
    /// Wraps a writer and emits the schema header immediately.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if the header cannot be written.
    pub fn new(writer: W) -> io::Result<Self> {
        let mut wtr = csv::WriterBuilder::new().from_writer(writer);
        wtr.write_record(HEADER.split(',').map(str::trim))?;
        Ok(Self { wtr })
    }

    /// Appends one record row.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if writing fails.
    pub fn append(&mut self, r: &StepOutput) -> io::Result<()> {
        self.wtr.write_record(&[
            format!("{:.2}", r.time_s),
            format!("{:.4}", r.set_p_mw),
            format!("{:.4}", r.set_q_mvar),
            format!("{:.4}", r.phys_p_mw),
            format!("{:.4}", r.phys_q_mvar),
            format!("{:.4}", r.phys_pf),
            format!("{:.4}", r.phys_v_pu),
            format!("{:.2}", r.phys_f_hz),
            format!("{:.4}", r.phys_i_ka),
            format!("{:.4}", r.max_q_mvar),
            format!("{:.4}", r.min_q_mvar),
            format!("{:.4}", r.meas_p_mw),
            format!("{:.4}", r.meas_q_mvar),
            format!("{:.4}", r.meas_pf),
            format!("{:.4}", r.meas_v_pu),
            format!("{:.2}", r.meas_f_hz),
            format!("{:.4}", r.meas_i_ka),
        ])?;
        Ok(())
    }

    /// Flushes buffered rows to the underlying writer.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if the flush fails.
    pub fn flush(&mut self) -> io::Result<()> {
        self.wtr.flush()
    }
}

/// Exports step records to a CSV file at the given path.
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_csv(records: &[StepOutput], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let buf = io::BufWriter::new(file);
    write_csv(records, buf)
}

/// Writes step records as CSV to any writer.
///
/// Writes a header row followed by one data row per tick. Produces
/// deterministic output for identical inputs.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_csv(records: &[StepOutput], writer: impl Write) -> io::Result<()> {
    let mut sink = CsvSink::new(writer)?;
    for r in records {
        sink.append(r)?;
    }
    sink.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(k: usize) -> StepOutput {
        StepOutput {
            time_s: k as f64 * 0.1,
            set_p_mw: 0.15,
            set_q_mvar: 0.05,
            phys_p_mw: 0.1234567,
            phys_q_mvar: 0.04,
            phys_pf: 0.95,
            phys_v_pu: 1.0,
            phys_f_hz: 50.0,
            phys_i_ka: 0.13,
            meas_p_mw: 0.11,
            meas_q_mvar: 0.03,
            meas_pf: 0.96,
            meas_v_pu: 1.0,
            meas_f_hz: 50.0,
            meas_i_ka: 0.12,
            max_q_mvar: 0.21,
            min_q_mvar: -0.21,
        }
    }

    #[test]
    fn header_matches_schema() {
        let records = vec![make_record(0)];
        let mut buf = Vec::new();
        write_csv(&records, &mut buf).ok();
        let output = String::from_utf8(buf).ok();
        let first_line = output.as_deref().unwrap_or("").lines().next().unwrap_or("");
        assert_eq!(
            first_line,
            "time_s,set_p_mw,set_q_mvar,\
             phys_p_mw,phys_q_mvar,phys_pf,phys_v_pu,phys_f_hz,phys_i_ka,\
             max_q_mvar,min_q_mvar,\
             meas_p_mw,meas_q_mvar,meas_pf,meas_v_pu,meas_f_hz,meas_i_ka"
        );
    }

    #[test]
    fn row_count_matches_record_count() {
        let records: Vec<StepOutput> = (0..24).map(make_record).collect();
        let mut buf = Vec::new();
        write_csv(&records, &mut buf).ok();
        let output = String::from_utf8(buf).ok();
        let lines: Vec<&str> = output.as_deref().unwrap_or("").lines().collect();
        // 1 header + 24 data rows
        assert_eq!(lines.len(), 25);
    }

    #[test]
    fn deterministic_output() {
        let records: Vec<StepOutput> = (0..5).map(make_record).collect();
        let mut buf1 = Vec::new();
        let mut buf2 = Vec::new();
        write_csv(&records, &mut buf1).ok();
        write_csv(&records, &mut buf2).ok();
        assert_eq!(buf1, buf2);
    }

    #[test]
    fn streaming_sink_matches_batch_writer() {
        let records: Vec<StepOutput> = (0..3).map(make_record).collect();

        let mut batch = Vec::new();
        write_csv(&records, &mut batch).ok();

        let mut streamed = Vec::new();
        {
            let mut sink = CsvSink::new(&mut streamed).expect("header should write");
            for r in &records {
                sink.append(r).expect("append should succeed");
            }
            sink.flush().expect("flush should succeed");
        }

        assert_eq!(batch, streamed);
    }

    #[test]
    fn round_trip_parseable() {
        let records: Vec<StepOutput> = (0..3).map(make_record).collect();
        let mut buf = Vec::new();
        write_csv(&records, &mut buf).ok();

        let mut rdr = csv::ReaderBuilder::new().from_reader(buf.as_slice());
        let headers = rdr.headers().cloned().ok();
        assert_eq!(headers.as_ref().map(csv::StringRecord::len), Some(17));

        let mut row_count = 0;
        for record in rdr.records() {
            let rec = record.ok();
            assert!(rec.is_some(), "every row should parse");
            let rec = rec.as_ref();
            // Every column parses as f64
            for i in 0..17 {
                let val: Result<f64, _> = rec.unwrap()[i].parse();
                assert!(val.is_ok(), "column {i} should parse as f64");
            }
            row_count += 1;
        }
        assert_eq!(row_count, 3);
    }
}
