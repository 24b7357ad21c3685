use anyhow::{bail, Context, Result};
use clap::Parser;
use glam::{Mat4, Vec3};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    time::Instant,
};
use walkdir::WalkDir;

use anchor_mesh::{narrowest_index_width, recording, AnchorEvent, AnchorId, RawGeometryBuffer, Record, Recording};

/// Packs a directory of OBJ meshes into an anchor recording, one mesh anchor
/// per file.
#[derive(Parser, Debug, Clone)]
#[command(name = "obj2anchorlog", version)]
struct Args {
    #[arg(long, default_value = "meshes")]
    input_dir: PathBuf,

    #[arg(long, default_value = "anchors.anlg")]
    output: PathBuf,

    /// Force the face index width in bytes (1, 2 or 4) instead of the narrowest that fits.
    #[arg(long)]
    index_width: Option<usize>,

    /// Seconds between consecutive anchor events in the recording.
    #[arg(long, default_value_t = 0.1)]
    time_step: f64,

    /// If both exist for the same stem, prefer .zip over .obj
    #[arg(long, default_value_t = false)]
    prefer_zip: bool,

    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

/// Geometry of one OBJ file after triangulation.
#[derive(Debug, Clone, PartialEq)]
struct ObjMesh {
    vertices: Vec<Vec3>,
    /// Per-vertex normals, only when every vertex got one.
    normals: Option<Vec<Vec3>>,
    faces: Vec<[u32; 3]>,
}

/// Collect `.obj` and `.zip` inputs, one per file stem, in stable order.
fn collect_inputs(input_dir: &Path, prefer_zip: bool) -> Vec<PathBuf> {
    let mut by_stem: std::collections::BTreeMap<String, PathBuf> = Default::default();

    for entry in WalkDir::new(input_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.into_path();
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        if ext != "obj" && ext != "zip" {
            continue;
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_owned();

        let is_zip = ext == "zip";
        by_stem
            .entry(stem)
            .and_modify(|existing| {
                let existing_is_zip = existing
                    .extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s.eq_ignore_ascii_case("zip"));
                if is_zip == prefer_zip && existing_is_zip != prefer_zip {
                    *existing = path.clone();
                }
            })
            .or_insert_with(|| path.clone());
    }

    by_stem.into_values().collect()
}

/// Resolve a 1-based (or negative, relative) OBJ index against `len` elements.
fn resolve_index(token: &str, len: usize) -> Result<usize> {
    let raw: i64 = token
        .parse()
        .with_context(|| format!("invalid index {token:?}"))?;
    let index = match raw {
        0 => bail!("OBJ indices start at 1"),
        r if r > 0 => r - 1,
        r => len as i64 + r,
    };
    if index < 0 || index as usize >= len {
        bail!("index {raw} out of range for {len} elements");
    }
    Ok(index as usize)
}

fn parse_vec3<'a>(mut parts: impl Iterator<Item = &'a str>, what: &str) -> Result<Vec3> {
    let mut next = |axis: &str| -> Result<f32> {
        parts
            .next()
            .with_context(|| format!("Missing {what} {axis} coordinate"))?
            .parse()
            .with_context(|| format!("Invalid {what} {axis} coordinate"))
    };
    let v = Vec3::new(next("x")?, next("y")?, next("z")?);
    if !v.is_finite() {
        bail!("non-finite {what}");
    }
    Ok(v)
}

/// Read `v`, `vn` and `f` records. Polygons are split into triangle fans
/// around their first corner; other record types are ignored.
fn parse_obj<R: Read>(reader: R) -> Result<ObjMesh> {
    let mut vertices = Vec::new();
    let mut obj_normals = Vec::new();
    let mut vertex_normals: Vec<Option<Vec3>> = Vec::new();
    let mut faces = Vec::new();
    let mut any_normal_refs = false;

    for (line_no, line_result) in BufReader::new(reader).lines().enumerate() {
        let line = line_result?;
        let mut parts = line.split_whitespace();
        let record = (|| -> Result<()> {
            match parts.next() {
                Some("v") => {
                    vertices.push(parse_vec3(parts, "vertex")?);
                    vertex_normals.push(None);
                }
                Some("vn") => obj_normals.push(parse_vec3(parts, "normal")?),
                Some("f") => {
                    let mut corners = Vec::with_capacity(4);
                    for token in parts {
                        // v, v/vt, v//vn or v/vt/vn
                        let mut refs = token.split('/');
                        let v = resolve_index(refs.next().unwrap_or(""), vertices.len())?;
                        if let Some(vn) = refs.nth(1).filter(|s| !s.is_empty()) {
                            let n = resolve_index(vn, obj_normals.len())?;
                            vertex_normals[v] = Some(obj_normals[n]);
                            any_normal_refs = true;
                        }
                        corners.push(v as u32);
                    }
                    if corners.len() < 3 {
                        bail!("face with {} corners", corners.len());
                    }
                    for k in 1..corners.len() - 1 {
                        faces.push([corners[0], corners[k], corners[k + 1]]);
                    }
                }
                _ => {}
            }
            Ok(())
        })();
        record.with_context(|| format!("line {}", line_no + 1))?;
    }

    let normals = if any_normal_refs {
        vertex_normals.into_iter().collect::<Option<Vec<_>>>()
    } else if !obj_normals.is_empty() && obj_normals.len() == vertices.len() {
        Some(obj_normals)
    } else {
        None
    };
    if normals.is_none() && !vertices.is_empty() {
        debug!("no complete per-vertex normals");
    }

    Ok(ObjMesh {
        vertices,
        normals,
        faces,
    })
}

/// Load one input: a plain .obj, or a .zip holding one .obj.
fn load_mesh(path: &Path) -> Result<ObjMesh> {
    let is_zip = path
        .extension()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.eq_ignore_ascii_case("zip"));

    if is_zip {
        let mut archive = zip::ZipArchive::new(File::open(path)?)?;
        let obj_name = archive
            .file_names()
            .find(|n| n.to_ascii_lowercase().ends_with(".obj"))
            .context("No .obj file found in zip archive")?
            .to_owned();
        let mesh = parse_obj(archive.by_name(&obj_name)?);
        mesh
    } else {
        parse_obj(File::open(path)?)
    }
}

fn anchor_event(mesh: &ObjMesh, index_width: Option<usize>) -> Result<AnchorEvent> {
    let width = index_width.unwrap_or_else(|| narrowest_index_width(&mesh.faces));
    let geometry = RawGeometryBuffer::from_parts(
        &mesh.vertices,
        mesh.normals.as_deref(),
        &mesh.faces,
        width,
    )?;
    Ok(AnchorEvent::Added {
        id: AnchorId::new_v4(),
        geometry,
        transform: Mat4::IDENTITY,
    })
}

/// Convert every input into one `Added` record, spaced `time_step` apart.
fn convert(args: &Args) -> Result<Recording> {
    let inputs = collect_inputs(&args.input_dir, args.prefer_zip);
    info!("Processing {} meshes...", inputs.len());

    let events: Vec<Option<AnchorEvent>> = inputs
        .par_iter()
        .map(|path| {
            let result = load_mesh(path).and_then(|mesh| {
                if mesh.vertices.is_empty() {
                    warn!("{}: no vertices", path.display());
                }
                anchor_event(&mesh, args.index_width)
            });
            match result {
                Ok(event) => {
                    debug!("{} -> anchor {}", path.display(), event.id());
                    Some(event)
                }
                Err(err) => {
                    warn!("Skipping {}: {:#}", path.display(), err);
                    None
                }
            }
        })
        .collect();

    let records = events
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(i, event)| Record::Anchor {
            timestamp: i as f64 * args.time_step,
            event,
        })
        .collect();

    Ok(Recording { records })
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.output.exists() && !args.overwrite {
        bail!("{} exists; pass --overwrite to replace it", args.output.display());
    }
    if !args.time_step.is_finite() || args.time_step < 0.0 {
        bail!("--time-step must be a non-negative number of seconds");
    }

    let started = Instant::now();
    let recording = convert(&args)?;
    if recording.records.is_empty() {
        warn!("No meshes converted; writing an empty recording");
    }

    recording::write_file(&args.output, &recording)
        .with_context(|| format!("writing {}", args.output.display()))?;
    info!(
        "Wrote {} anchors to {} in {:.2?}",
        recording.records.len(),
        args.output.display(),
        started.elapsed()
    );
    Ok(())
}
