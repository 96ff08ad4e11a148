// ABOUTME: Forward-only row stream over the spooled CSV result parts of one job
// ABOUTME: The first part's header names the columns; later headers must match it

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::io::Read;

type PartReader = csv::Reader<Box<dyn Read + Send>>;

/// One data row, numbered from 1 after the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub number: u64,
    pub fields: Vec<String>,
}

/// Lazy iterator over every data row of every result part, in order.
pub struct RowStream {
    header: Vec<String>,
    current: PartReader,
    pending: VecDeque<Box<dyn Read + Send>>,
    record: csv::StringRecord,
    rows_read: u64,
    part: usize,
}

fn part_reader(part: Box<dyn Read + Send>) -> PartReader {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(part)
}

fn lowercase_header(reader: &mut PartReader, part: usize) -> Result<Vec<String>> {
    let header = reader
        .headers()
        .with_context(|| format!("Failed to read header of result part {}", part))?;
    Ok(header.iter().map(|h| h.trim().to_lowercase()).collect())
}

impl RowStream {
    /// Stream a single reader.
    pub fn from_reader(reader: impl Read + Send + 'static) -> Result<Self> {
        Self::from_parts(vec![Box::new(reader)])
    }

    /// Stream several result parts as one sequence of rows.
    pub fn from_parts(parts: Vec<Box<dyn Read + Send>>) -> Result<Self> {
        let mut pending: VecDeque<_> = parts.into();
        let first = match pending.pop_front() {
            Some(first) => first,
            None => bail!("Extraction produced no result parts"),
        };

        let mut current = part_reader(first);
        let header = lowercase_header(&mut current, 1)?;
        if header.iter().all(|h| h.is_empty()) {
            bail!("Extraction result has an empty header");
        }

        Ok(Self {
            header,
            current,
            pending,
            record: csv::StringRecord::new(),
            rows_read: 0,
            part: 1,
        })
    }

    /// Lowercased column names, in result order.
    pub fn header(&self) -> &[String] {
        &self.header
    }

    fn advance_part(&mut self) -> Result<bool> {
        let next = match self.pending.pop_front() {
            Some(next) => next,
            None => return Ok(false),
        };
        self.part += 1;
        let mut reader = part_reader(next);
        let header = lowercase_header(&mut reader, self.part)?;
        if header != self.header {
            bail!(
                "Result part {} header [{}] differs from [{}]",
                self.part,
                header.join(","),
                self.header.join(",")
            );
        }
        self.current = reader;
        Ok(true)
    }

    fn read_next(&mut self) -> Result<Option<RawRow>> {
        loop {
            let has_record = self
                .current
                .read_record(&mut self.record)
                .with_context(|| {
                    format!(
                        "Failed to read row {} (result part {})",
                        self.rows_read + 1,
                        self.part
                    )
                })?;
            if has_record {
                self.rows_read += 1;
                return Ok(Some(RawRow {
                    number: self.rows_read,
                    fields: self.record.iter().map(str::to_string).collect(),
                }));
            }
            if !self.advance_part()? {
                return Ok(None);
            }
        }
    }
}

impl Iterator for RowStream {
    type Item = Result<RawRow>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}
