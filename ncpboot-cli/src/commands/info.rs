//! Image info and port listing command implementations.

use {
    anyhow::{Context, Result},
    console::style,
    ncpboot::{
        Aat, DfuCommand, DfuSession, Ebl, EblTag, MemFlash,
        dfu::{Reply, SessionState},
        protocol::bgapi::{UPLOAD_CHUNK_SIZE, result},
    },
    serde::Serialize,
    std::path::Path,
};

/// Target flash layout used to simulate programming.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub page_size: u32,
    pub bootloader_size: u32,
    pub flash_size: u32,
}

#[derive(Debug, Serialize)]
struct TagCount {
    tag: EblTag,
    count: usize,
}

#[derive(Debug, Serialize)]
struct AatSummary {
    image_type: &'static str,
    name: String,
    factory: bool,
    top_of_stack: String,
    reset_vector: String,
    vector_table: String,
    pages: String,
    software_version: u16,
    software_build: u16,
    timestamp: u32,
    image_crc: String,
}

impl AatSummary {
    fn new(aat: &Aat) -> Self {
        let range = aat.primary_range();
        Self {
            image_type: aat.image_type_name(),
            name: aat.image_name(),
            factory: aat.is_factory_image(),
            top_of_stack: format!("0x{:08X}", aat.top_of_stack),
            reset_vector: format!("0x{:08X}", aat.reset_vector),
            vector_table: format!("0x{:08X}", aat.vector_table),
            pages: format!("{}..={}", range.first, range.last),
            software_version: aat.software_version,
            software_build: aat.software_build,
            timestamp: aat.timestamp,
            image_crc: format!("0x{:08X}", aat.image_crc),
        }
    }
}

/// What `info` found out about an image.
#[derive(Debug, Serialize)]
struct ImageReport {
    file_size: u64,
    record_count: usize,
    records: Vec<TagCount>,
    terminated: bool,
    encrypted: bool,
    trailing_bytes: usize,
    header_address: Option<String>,
    program_bytes: usize,
    programmed_bytes: u64,
    out_of_range_bytes: u64,
    upload_result: String,
    crc_valid: bool,
    aat: Option<AatSummary>,
}

fn count_tags(ebl: &Ebl) -> Vec<TagCount> {
    let mut counts: Vec<TagCount> = Vec::new();
    for record in &ebl.records {
        match counts
            .iter_mut()
            .find(|c| c.tag == record.tag)
        {
            Some(entry) => entry.count += 1,
            None => counts.push(TagCount {
                tag: record.tag,
                count: 1,
            }),
        }
    }
    counts
}

/// Run the image through a bootloader session backed by simulated flash.
fn simulate(data: &[u8], geometry: &Geometry) -> Result<(DfuSession<MemFlash>, u16)> {
    let flash = MemFlash::new(
        geometry.flash_size,
        geometry.page_size,
        geometry.bootloader_size,
    )
    .context("Invalid flash geometry")?;
    let mut session = DfuSession::new(flash);
    session.handle(&DfuCommand::FlashSetAddress(0));

    for chunk in data.chunks(UPLOAD_CHUNK_SIZE) {
        if let Reply::Response { result: code, .. } =
            session.handle(&DfuCommand::FlashUpload(chunk.to_vec()))
        {
            if code != result::SUCCESS {
                return Ok((session, code));
            }
        }
    }

    let code = match session.handle(&DfuCommand::FlashUploadFinish) {
        Reply::Response { result: code, .. } => code,
        _ => result::SUCCESS,
    };
    Ok((session, code))
}

fn build_report(data: &[u8], geometry: &Geometry) -> Result<ImageReport> {
    let ebl = Ebl::parse(data)?;
    let (session, code) = simulate(data, geometry)?;

    let (programmed_bytes, out_of_range_bytes) = session
        .decoder()
        .map_or((0, 0), |d| (d.programmed_bytes(), d.out_of_range_bytes()));
    let aat = Aat::read_from(session.flash(), session.application_base())
        .ok()
        .filter(Aat::is_application);

    Ok(ImageReport {
        file_size: data.len() as u64,
        record_count: ebl.records.len(),
        records: count_tags(&ebl),
        terminated: ebl.is_terminated(),
        encrypted: ebl.is_encrypted(),
        trailing_bytes: ebl.trailing,
        header_address: ebl
            .records
            .first()
            .and_then(ncpboot::EblRecord::address)
            .map(|a| format!("0x{a:08X}")),
        program_bytes: ebl.program_bytes(),
        programmed_bytes,
        out_of_range_bytes,
        upload_result: result::name(code).to_string(),
        crc_valid: session.state() == SessionState::Validated,
        aat: aat.as_ref().map(AatSummary::new),
    })
}

/// Info command implementation.
pub(crate) fn cmd_info(image: &Path, geometry: &Geometry, json: bool) -> Result<()> {
    let data = std::fs::read(image)
        .with_context(|| format!("Failed to load image {}", image.display()))?;
    let report = build_report(&data, geometry)
        .with_context(|| format!("Failed to parse image {}", image.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let yes_no = |b: bool| if b { style("yes").green() } else { style("no").red() };

    eprintln!(
        "{}",
        style(format!("Image {}", image.display()))
            .bold()
            .underlined()
    );
    eprintln!("  File size:        {} bytes", report.file_size);
    eprintln!("  Records:          {}", report.record_count);
    for entry in &report.records {
        eprintln!("    {:<18} {}", entry.tag.name(), entry.count);
    }
    if let Some(address) = &report.header_address {
        eprintln!("  Header address:   {address}");
    }
    eprintln!("  Terminated:       {}", yes_no(report.terminated));
    eprintln!("  Encrypted:        {}", yes_no(report.encrypted));
    if report.trailing_bytes > 0 {
        eprintln!("  Trailing bytes:   {}", report.trailing_bytes);
    }
    eprintln!("  Program data:     {} bytes", report.program_bytes);

    eprintln!(
        "\n{}",
        style(format!(
            "Simulated flash ({:#x} bytes, {:#x} pages, app at {:#x})",
            geometry.flash_size, geometry.page_size, geometry.bootloader_size
        ))
        .bold()
        .underlined()
    );
    eprintln!("  Programmed:       {} bytes", report.programmed_bytes);
    if report.out_of_range_bytes > 0 {
        eprintln!(
            "  {} {} bytes fall outside the application area",
            style("⚠").yellow(),
            report.out_of_range_bytes
        );
    }
    eprintln!("  Upload result:    {}", report.upload_result);
    eprintln!("  CRC valid:        {}", yes_no(report.crc_valid));

    if let Some(aat) = &report.aat {
        eprintln!("\n{}", style("Application Address Table").bold().underlined());
        eprintln!("  Type:             {}", aat.image_type);
        if !aat.name.is_empty() {
            eprintln!("  Name:             {}", style(&aat.name).cyan());
        }
        eprintln!("  Factory image:    {}", yes_no(aat.factory));
        eprintln!("  Stack pointer:    {}", aat.top_of_stack);
        eprintln!("  Reset vector:     {}", aat.reset_vector);
        eprintln!("  Vector table:     {}", aat.vector_table);
        eprintln!("  Pages:            {}", aat.pages);
        eprintln!(
            "  Software:         {}.{}",
            aat.software_version, aat.software_build
        );
        eprintln!("  Image CRC:        {}", aat.image_crc);
    }

    Ok(())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = ncpboot::detect_ports();

    if json {
        println!("{}", serde_json::to_string_pretty(&detected)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available serial ports")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        eprintln!("  {} {}", style("•").green(), port.describe());
    }

    if let Some(selected) = ncpboot::device::select_port(&detected) {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&selected.name)
                .cyan()
                .bold()
        );
    }

    Ok(())
}
