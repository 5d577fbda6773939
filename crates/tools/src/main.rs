use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use formats::{Feature, decode_header, encode_source, features_from_geojson_str, features_to_geojson_value};
use geo::Geometry;
use overlay::{GeographySettings, SketchRef, clip_to_geographies, prepare_sketch};
use serde_json::{Value, json};
use sketches::EngineConfig;
use streaming::{FileRangeFetcher, HttpRangeFetcher, RangeFetcher, SourceCache};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Clipping-layer packing and sketch fragment inspection")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode a GeoJSON file as a range-readable clipping-layer source
    Pack { input: PathBuf, output: PathBuf },

    /// Print the header of a packed source
    Inspect { input: PathBuf },

    /// Clip a sketch to geographies and print the clipped sketch and its fragments as GeoJSON
    Clip {
        /// GeoJSON Feature holding the sketch polygon
        #[arg(long)]
        sketch: PathBuf,

        /// JSON array of geography settings; every listed geography is active
        #[arg(long)]
        geographies: PathBuf,

        /// Engine settings (JSON). Defaults to SKETCH_* environment variables
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory clipping-layer sources are read from, unless the config names a base URL
        #[arg(long, default_value = ".")]
        sources: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = real_main().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn real_main() -> Result<(), String> {
    match Args::parse().command {
        Command::Pack { input, output } => {
            let (count, hash) = pack_file(&input, &output)?;
            eprintln!("wrote {} ({count} features, blake3={hash})", output.display());
            Ok(())
        }
        Command::Inspect { input } => {
            let bytes = fs::read(&input).map_err(|e| format!("read {input:?}: {e}"))?;
            let header = decode_header(&bytes).map_err(|e| format!("decode {input:?}: {e}"))?;
            let b = header.bounds;
            println!(
                "version={} features={} bounds=[{}, {}, {}, {}]",
                header.version, header.feature_count, b.min_x, b.min_y, b.max_x, b.max_y
            );
            Ok(())
        }
        Command::Clip {
            sketch,
            geographies,
            config,
            sources,
        } => {
            let config = match config {
                Some(path) => EngineConfig::from_path(&path).map_err(|e| e.to_string())?,
                None => EngineConfig::from_env(),
            };
            let out = cmd_clip(&sketch, &geographies, &config, &sources).await?;
            let payload = serde_json::to_string_pretty(&out).map_err(|e| format!("json: {e}"))?;
            println!("{payload}");
            Ok(())
        }
    }
}

/// Returns the feature count and the blake3 hash of the written bytes.
fn pack_file(input: &Path, output: &Path) -> Result<(usize, String), String> {
    let payload = fs::read_to_string(input).map_err(|e| format!("read {input:?}: {e}"))?;
    let features = features_from_geojson_str(&payload).map_err(|e| format!("parse {input:?}: {e}"))?;
    let bytes = encode_source(&features).map_err(|e| format!("encode: {e}"))?;
    fs::write(output, &bytes).map_err(|e| format!("write {output:?}: {e}"))?;
    Ok((features.len(), blake3::hash(&bytes).to_hex().to_string()))
}

async fn cmd_clip(
    sketch: &Path,
    geographies: &Path,
    config: &EngineConfig,
    sources: &Path,
) -> Result<Value, String> {
    let payload = fs::read_to_string(sketch).map_err(|e| format!("read {sketch:?}: {e}"))?;
    let feature = Feature::from_geojson_str(&payload).map_err(|e| format!("parse {sketch:?}: {e}"))?;
    let payload = fs::read_to_string(geographies).map_err(|e| format!("read {geographies:?}: {e}"))?;
    let geographies: Vec<GeographySettings> =
        serde_json::from_str(&payload).map_err(|e| format!("parse geographies: {e}"))?;

    let fetcher: Arc<dyn RangeFetcher> = match config.source_base_url {
        Some(_) => Arc::new(HttpRangeFetcher::new()),
        None => Arc::new(FileRangeFetcher::with_root(sources)),
    };
    let cache = Arc::new(SourceCache::new(fetcher, config.source_cache_options()));
    let executor = config.clip_executor(cache);

    let prepared = prepare_sketch(&feature).map_err(|e| e.to_string())?;
    let active: Vec<_> = geographies.iter().map(|g| g.id).collect();
    let output = clip_to_geographies(
        &prepared,
        &geographies,
        &active,
        Vec::new(),
        SketchRef::Pending,
        executor.as_ref(),
        &config.fragment_options(),
    )
    .await
    .map_err(|e| e.to_string())?;
    info!(fragments = output.fragments.len(), "sketch clipped");

    let fragments: Vec<Feature> = output
        .fragments
        .iter()
        .map(|f| {
            Feature::new(Geometry::Polygon(f.geometry.clone()))
                .with_id(f.hash().to_string())
                .with_property("geographyIds", json!(f.geography_ids))
                .with_property("areaM2", f.area_m2())
        })
        .collect();
    let clipped = Feature::new(Geometry::MultiPolygon(output.clipped)).with_properties(feature.properties);
    Ok(json!({
        "sketch": clipped.to_geojson_value(),
        "fragments": features_to_geojson_value(&fragments),
    }))
}

#[cfg(test)]
mod tests {
    use super::{cmd_clip, pack_file};
    use sketches::EngineConfig;
    use std::fs;

    const LAND: &str = r#"{"type":"FeatureCollection","features":[
        {"type":"Feature","properties":{"name":"west"},
         "geometry":{"type":"Polygon","coordinates":[[[-10,-10],[0,-10],[0,10],[-10,10],[-10,-10]]]}}
    ]}"#;

    #[test]
    fn pack_writes_a_decodable_source() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("west.geojson");
        let output = dir.path().join("west.sksf");
        fs::write(&input, LAND).unwrap();

        let (count, hash) = pack_file(&input, &output).unwrap();
        assert_eq!(count, 1);
        assert_eq!(hash.len(), 64);
        let bytes = fs::read(&output).unwrap();
        assert_eq!(formats::decode_header(&bytes).unwrap().feature_count, 1);
        assert!(pack_file(&dir.path().join("missing.geojson"), &output).is_err());
    }

    #[tokio::test]
    async fn clip_reads_sources_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("west.geojson");
        fs::write(&input, LAND).unwrap();
        pack_file(&input, &dir.path().join("west.sksf")).unwrap();

        let sketch = dir.path().join("sketch.geojson");
        fs::write(
            &sketch,
            r#"{"type":"Feature","properties":{"name":"A"},
               "geometry":{"type":"Polygon","coordinates":[[[-0.02,0],[0.02,0],[0.02,0.02],[-0.02,0.02],[-0.02,0]]]}}"#,
        )
        .unwrap();
        let geographies = dir.path().join("geographies.json");
        fs::write(
            &geographies,
            r#"[{"id": 7, "clippingLayers": [{"op": "INTERSECT", "source": "west.sksf"}]}]"#,
        )
        .unwrap();

        let out = cmd_clip(&sketch, &geographies, &EngineConfig::default(), dir.path())
            .await
            .unwrap();
        assert_eq!(out["fragments"]["features"].as_array().unwrap().len(), 1);
        assert_eq!(out["fragments"]["features"][0]["properties"]["geographyIds"][0], 7);
        assert_eq!(out["sketch"]["properties"]["name"], "A");
    }
}
