//! Plan wire codec: one JSON document per stream, optionally gzipped.

use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crucible_plan::{schema_compatible, Plan, PLAN_SCHEMA_VERSION};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Reads a single plan document from `reader`. Gzip framing is sniffed from
/// the first two bytes, so senders may compress or not as they please.
pub fn read_plan<R: Read>(mut reader: R) -> Result<Plan> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw).context("reading plan")?;
    if raw.is_empty() {
        bail!("empty plan stream");
    }

    let plan: Plan = if raw.starts_with(&GZIP_MAGIC) {
        serde_json::from_reader(GzDecoder::new(&raw[..])).context("decoding gzipped plan")?
    } else {
        serde_json::from_slice(&raw).context("decoding plan")?
    };

    if !schema_compatible(PLAN_SCHEMA_VERSION, &plan.schema_version) {
        bail!(
            "plan schema {} is not compatible with {}",
            plan.schema_version,
            PLAN_SCHEMA_VERSION
        );
    }
    Ok(plan)
}

pub fn write_plan<W: Write>(mut writer: W, plan: &Plan) -> Result<()> {
    serde_json::to_writer(&mut writer, plan).context("encoding plan")?;
    writer.flush().context("flushing plan")?;
    Ok(())
}

pub fn write_plan_gz<W: Write>(writer: W, plan: &Plan) -> Result<()> {
    let mut enc = GzEncoder::new(writer, Compression::default());
    serde_json::to_writer(&mut enc, plan).context("encoding plan")?;
    enc.finish().context("finishing gzip stream")?;
    Ok(())
}
