use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the standard output.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("could not encode a CSV field")]
    EncodeCsv,
    #[error("CSV headers must be written before any record")]
    LateCsvHeaders,
}

impl Args {
    pub fn to_output(&self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        let formatter = match self.format {
            Format::Table => {
                Formatter::Table { comfy: new_table(), headers: Vec::new(), rows: 0 }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_records: false },
        };
        Ok(Output { path: self.output.clone(), io, formatter })
    }
}

fn new_table() -> comfy_table::Table {
    let mut comfy = comfy_table::Table::new();
    comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
    comfy
}

/// Records written in one of the supported formats.
///
/// Tables are only printed on [`Output::flush`] or [`Output::commit`], as column widths depend on
/// every row.
pub struct Output {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table, headers: Vec<&'static str>, rows: usize },
    Jsonl,
}

impl Output {
    pub fn table_headers(&mut self, hdrs: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                if *written_records {
                    return Err(Error::LateCsvHeaders);
                }
                *written_records = true;
                self.write_csv_row(&hdrs)?;
            }
            Formatter::Table { comfy, headers, .. } => {
                comfy.set_header(hdrs.clone());
                *headers = hdrs;
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn write_csv_row<V: std::ops::Deref<Target = str>>(
        &mut self,
        values: &[V],
    ) -> Result<(), Error> {
        // Worst case every byte is a quote that needs escaping, plus the surrounding quotes.
        let max_len = 2 + 2 * values.iter().map(|v| v.len()).max().unwrap_or(0);
        let mut output = vec![0; max_len];
        let mut writer = csv_core::Writer::new();
        for (index, value) in values.iter().enumerate() {
            if index != 0 {
                let (WriteResult::InputEmpty, ob) = writer.delimiter(&mut output) else {
                    return Err(Error::EncodeCsv);
                };
                self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
            }
            let (WriteResult::InputEmpty, _, ob) = writer.field(value.as_bytes(), &mut output)
            else {
                return Err(Error::EncodeCsv);
            };
            self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
        }
        let (WriteResult::InputEmpty, ob) = writer.terminator(&mut output) else {
            return Err(Error::EncodeCsv);
        };
        self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))
    }

    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy, rows, .. } => {
                comfy.add_row(table_row());
                *rows += 1;
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    /// Push out everything recorded so far, and for tables start a new one with the same headers.
    pub fn flush(&mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy, headers, rows } = &mut self.formatter {
            if *rows != 0 {
                *rows = 0;
                let mut fresh = new_table();
                if !headers.is_empty() {
                    fresh.set_header(headers.clone());
                }
                let table = std::mem::replace(comfy, fresh);
                writeln!(self.io, "{table}").map_err(|e| self.write_error(e))?;
            }
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }

    pub fn commit(mut self) -> Result<(), Error> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn output(formatter: Formatter) -> (Output, Sink) {
        let sink = Sink::default();
        let output = Output { path: None, io: Box::new(sink.clone()), formatter };
        (output, sink)
    }

    fn text(sink: &Sink) -> String {
        String::from_utf8(sink.0.lock().unwrap().clone()).unwrap()
    }

    #[test]
    fn csv_quotes_where_needed() {
        let (mut out, sink) = output(Formatter::Csv { written_records: false });
        out.table_headers(vec!["Address", "Name"]).unwrap();
        out.result(|| vec!["65".into(), "Cooling, \"summer\"".into()], || ()).unwrap();
        out.commit().unwrap();
        assert_eq!(text(&sink), "Address,Name\n65,\"Cooling, \"\"summer\"\"\"\n");
    }

    #[test]
    fn csv_headers_after_records_are_refused() {
        let (mut out, _) = output(Formatter::Csv { written_records: false });
        out.result(|| vec!["1".into()], || ()).unwrap();
        assert!(matches!(out.table_headers(vec!["Address"]), Err(Error::LateCsvHeaders)));
    }

    #[test]
    fn jsonl_writes_one_record_per_line() {
        let (mut out, sink) = output(Formatter::Jsonl);
        out.result(Vec::new, || serde_json::json!({"address": 67, "raw": 450})).unwrap();
        out.result(Vec::new, || serde_json::json!({"address": 68, "raw": null})).unwrap();
        out.commit().unwrap();
        assert_eq!(text(&sink), "{\"address\":67,\"raw\":450}\n{\"address\":68,\"raw\":null}\n");
    }

    #[test]
    fn table_flush_keeps_headers_for_the_next_batch() {
        let table = Formatter::Table { comfy: new_table(), headers: Vec::new(), rows: 0 };
        let (mut out, sink) = output(table);
        out.table_headers(vec!["Address"]).unwrap();
        out.result(|| vec!["65".into()], || ()).unwrap();
        out.flush().unwrap();
        out.result(|| vec!["66".into()], || ()).unwrap();
        out.commit().unwrap();
        let text = text(&sink);
        assert_eq!(text.matches("Address").count(), 2);
        assert!(text.contains("65") && text.contains("66"));
    }
}
