use async_trait::async_trait;
use eyre::Result;
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::point::Point;

#[async_trait]
pub trait Codec {
    async fn encode<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W, point: &Point)
        -> Result<()>;
    /// Decodes the next point, or `None` at end of input.
    async fn decode<R: AsyncBufRead + Unpin + Send>(&self, reader: &mut R)
        -> Result<Option<Point>>;
}

/// Newline delimited JSON: one `{"x":..,"y":..}` object or `[x, y]` pair per line.
pub struct JsonCodec;

#[async_trait]
impl Codec for JsonCodec {
    async fn encode<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        point: &Point,
    ) -> Result<()> {
        let mut buf = serde_json::to_vec(point)?;
        buf.push(b'\n');
        writer.write_all(&buf).await?;
        Ok(())
    }

    async fn decode<R: AsyncBufRead + Unpin + Send>(
        &self,
        reader: &mut R,
    ) -> Result<Option<Point>> {
        let Some(line) = next_line(reader).await? else {
            return Ok(None);
        };
        serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| eyre::eyre!("invalid JSON point {:?}: {}", line, e))
    }
}

/// `x,y` records, one per line. [`read_points`] also accepts an `x,y`
/// header line in front of the first record.
pub struct CsvCodec;

#[async_trait]
impl Codec for CsvCodec {
    async fn encode<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        point: &Point,
    ) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::with_capacity(32));
        wtr.serialize((point.x, point.y))?;
        let buf = wtr.into_inner().map_err(|e| eyre::eyre!(e.to_string()))?;
        writer.write_all(&buf).await?;
        Ok(())
    }

    async fn decode<R: AsyncBufRead + Unpin + Send>(
        &self,
        reader: &mut R,
    ) -> Result<Option<Point>> {
        match next_line(reader).await? {
            Some(line) => csv_point(&line).map(Some),
            None => Ok(None),
        }
    }
}

fn csv_record(line: &str) -> Result<csv::StringRecord> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(line.as_bytes());
    rdr.records()
        .next()
        .transpose()?
        .ok_or_else(|| eyre::eyre!("invalid CSV point {:?}: empty record", line))
}

fn csv_point(line: &str) -> Result<Point> {
    let record = csv_record(line)?;
    if record.len() != 2 {
        eyre::bail!(
            "invalid CSV point {:?}: expected 2 fields, found {}",
            line,
            record.len()
        );
    }
    let (x, y): (f64, f64) = record
        .deserialize(None)
        .map_err(|e| eyre::eyre!("invalid CSV point {:?}: {}", line, e))?;
    Ok(Point { x, y })
}

// A header has no numeric field at all.
fn is_csv_header(line: &str) -> bool {
    csv_record(line)
        .map(|r| r.iter().all(|f| f.parse::<f64>().is_err()))
        .unwrap_or(false)
}

// Next non-blank line with its terminator stripped, or None at EOF.
async fn next_line<R: AsyncBufRead + Unpin + Send>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_string()));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Csv,
}

impl Format {
    /// Guesses the encoding from the first bytes of an input.
    pub fn detect(buf: &[u8]) -> Format {
        match buf.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => Format::Json,
            _ => Format::Csv,
        }
    }
}

impl FromStr for Format {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Format::Json),
            "csv" => Ok(Format::Csv),
            _ => eyre::bail!("invalid encoding: {}", s),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Format::Json => f.write_str("json"),
            Format::Csv => f.write_str("csv"),
        }
    }
}

/// Reads a whole series. The format is detected from the first
/// non-whitespace byte of the input.
pub async fn read_points<R: AsyncBufRead + Unpin + Send>(reader: &mut R) -> Result<Vec<Point>> {
    let format = loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(Vec::new());
        }
        match buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(i) => {
                let format = Format::detect(&buf[i..]);
                reader.consume(i);
                break format;
            }
            None => {
                let n = buf.len();
                reader.consume(n);
            }
        }
    };

    let mut points = Vec::new();
    if format == Format::Csv {
        match next_line(reader).await? {
            Some(line) if is_csv_header(&line) => {}
            Some(line) => points.push(csv_point(&line)?),
            None => return Ok(points),
        }
    }
    loop {
        let next = match format {
            Format::Json => JsonCodec.decode(reader).await?,
            Format::Csv => CsvCodec.decode(reader).await?,
        };
        match next {
            Some(p) => points.push(p),
            None => return Ok(points),
        }
    }
}

pub async fn write_points<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    format: Format,
    points: &[Point],
) -> Result<()> {
    for p in points {
        match format {
            Format::Json => JsonCodec.encode(writer, p).await?,
            Format::Csv => CsvCodec.encode(writer, p).await?,
        }
    }
    Ok(())
}
