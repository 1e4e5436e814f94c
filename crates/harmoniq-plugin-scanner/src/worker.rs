use std::io::{BufReader, BufWriter, Read, Write};

use harmoniq_plugin_db::xml::{descriptors_to_xml, EMPTY_DOCUMENT};
use harmoniq_plugin_db::{FormatRegistry, PluginDescription};
use tracing::{debug, info, warn};

use crate::protocol::{read_frame, write_frame, ProtocolError, ScanRequest};

/// Serves scan requests until the host closes `input`.
///
/// The first frame written is the session token so the host can tell its own
/// worker apart from anything else on the pipe. Each request is answered with
/// exactly one descriptor document; probe failures answer with an empty one.
pub fn run_worker<R, W>(
    input: R,
    output: W,
    token: &str,
    registry: &FormatRegistry,
) -> Result<(), ProtocolError>
where
    R: Read,
    W: Write,
{
    let mut reader = BufReader::new(input);
    let mut writer = BufWriter::new(output);
    write_frame(&mut writer, token.as_bytes())?;
    info!(pid = std::process::id(), "scan worker ready");

    let mut served = 0usize;
    while let Some(message) = read_frame(&mut reader)? {
        let request = ScanRequest::decode(&message)?;
        let found = probe(registry, &request);
        let document = descriptors_to_xml(&found).unwrap_or_else(|err| {
            warn!(%err, "failed to encode descriptors");
            EMPTY_DOCUMENT.to_string()
        });
        write_frame(&mut writer, document.as_bytes())?;
        served += 1;
    }

    debug!(served, "host closed the connection, scan worker exiting");
    Ok(())
}

fn probe(registry: &FormatRegistry, request: &ScanRequest) -> Vec<PluginDescription> {
    let Some(backend) = registry.find(&request.format_name) else {
        warn!(format = %request.format_name, "no backend for requested format");
        return Vec::new();
    };
    debug!(format = %request.format_name, locator = %request.locator, "probing");
    match backend.enumerate_descriptors(&request.locator) {
        Ok(found) => found,
        Err(err) => {
            warn!(%err, locator = %request.locator, "probe failed");
            Vec::new()
        }
    }
}
