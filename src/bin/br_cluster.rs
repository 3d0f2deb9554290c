// src/bin/br_cluster.rs
//
// Berger-Rigoutsos clustering driver: builds a tag field, decomposes it over N
// in-process ranks and clusters it.
//
// Output: out/br_cluster/<scenario>/
//   config.json  cluster config + scenario + run info
//   boxes.csv    owner,local,lo_i,lo_j,hi_i,hi_j
//   stats.json   per-rank statistics
//   boxes.png    tags and boxes
//
// Usage:
//   cargo run --release --bin br_cluster -- scenario=bubbles n=128 ranks=4 \
//       eff=0.7 DEV_owner_mode=FEWEST_OWNED
//
// Any `key=value` not recognised as a scenario option is passed to the cluster
// config (same keys as the JSON form). `config=path.json` loads a base config.
// Logging is controlled by RUST_LOG (default: info).

use amr_cluster::amr::indicator::{ScalarField2D, tag_cells_from_indicator};
use amr_cluster::amr::{
    BergerRigoutsos, ClusterComm, ClusterOutput, IndexBox, RelationshipMode, TagLevel,
};
use amr_cluster::comm::{Comm, run_on_ranks};
use amr_cluster::config::{ClusterConfig, RunConfig, RunInfo, ScenarioConfig};
use amr_cluster::visualisation::save_cluster_plot;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing_subscriber::EnvFilter;

struct Options {
    scenario: String,
    n: usize,
    tile: usize,
    ranks: usize,
    min_box: i32,
    eff: f64,
    combine: f64,
    width: i32,
    frac: f64,
    plot: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            scenario: "bubbles".to_string(),
            n: 128,
            tile: 16,
            ranks: 4,
            min_box: 2,
            eff: 0.7,
            combine: 0.8,
            width: 1,
            frac: 0.25,
            plot: true,
        }
    }
}

fn parse_args() -> Result<(Options, ClusterConfig), Box<dyn std::error::Error>> {
    let mut opts = Options::default();
    let mut overrides = Vec::new();
    let mut cfg = ClusterConfig::default();

    for arg in std::env::args().skip(1) {
        let Some((key, value)) = arg.split_once('=') else {
            return Err(format!("expected key=value, got '{arg}'").into());
        };
        match key {
            "scenario" => opts.scenario = value.to_string(),
            "n" => opts.n = value.parse()?,
            "tile" => opts.tile = value.parse()?,
            "ranks" => opts.ranks = value.parse()?,
            "min" => opts.min_box = value.parse()?,
            "eff" => opts.eff = value.parse()?,
            "combine" => opts.combine = value.parse()?,
            "width" => opts.width = value.parse()?,
            "frac" => opts.frac = value.parse()?,
            "plot" => opts.plot = value.parse()?,
            "config" => cfg = ClusterConfig::from_path(Path::new(value))?,
            _ => overrides.push((key.to_string(), value.to_string())),
        }
    }
    for (key, value) in overrides {
        cfg.set(&key, &value)?;
    }
    if opts.ranks == 0 || opts.n == 0 || opts.tile == 0 {
        return Err("n, tile and ranks must be positive".into());
    }
    Ok((opts, cfg))
}

/// Global tag array for a named scenario.
fn build_tags(opts: &Options, domain: IndexBox<2>) -> Result<Vec<i32>, String> {
    let n = opts.n as f64;
    let tags = match opts.scenario.as_str() {
        // One dense square in the middle.
        "block" => domain
            .cells()
            .map(|c| {
                let inside = |v: i32| (v as f64) >= 0.25 * n && (v as f64) < 0.75 * n;
                i32::from(inside(c[0]) && inside(c[1]))
            })
            .collect(),
        // Two separated squares.
        "two_blocks" => domain
            .cells()
            .map(|c| {
                let (x, y) = (c[0] as f64 / n, c[1] as f64 / n);
                let a = (0.1..0.3).contains(&x) && (0.1..0.3).contains(&y);
                let b = (0.6..0.9).contains(&x) && (0.55..0.85).contains(&y);
                i32::from(a || b)
            })
            .collect(),
        // A thin diagonal line.
        "diagonal" => domain.cells().map(|c| i32::from(c[0] == c[1])).collect(),
        // Walls of two smooth bubbles, tagged by the gradient indicator.
        "bubbles" => {
            let centers = [(0.3 * n, 0.35 * n), (0.7 * n, 0.65 * n)];
            let radius = 0.15 * n;
            let wall = 0.02 * n;
            let field = ScalarField2D::from_fn(domain, |c| {
                let (x, y) = (c[0] as f64 + 0.5, c[1] as f64 + 0.5);
                centers
                    .iter()
                    .map(|&(cx, cy)| {
                        let r = ((x - cx).powi(2) + (y - cy).powi(2)).sqrt();
                        0.5 * (1.0 - ((r - radius) / wall).tanh())
                    })
                    .sum()
            });
            let (tags, stats) = tag_cells_from_indicator(&field, opts.frac, 1);
            println!(
                "indicator: max={:.3e} threshold={:.3e} tagged={}",
                stats.max, stats.threshold, stats.tagged
            );
            tags
        }
        other => return Err(format!("unknown scenario '{other}'")),
    };
    Ok(tags)
}

fn write_boxes_csv(path: &Path, out: &ClusterOutput<2>) -> io::Result<()> {
    let mut f = fs::File::create(path)?;
    writeln!(f, "owner,local,lo_i,lo_j,hi_i,hi_j")?;
    for b in &out.global_boxes {
        writeln!(
            f,
            "{},{},{},{},{},{}",
            b.id.owner,
            b.id.local,
            b.cell_box.lower[0],
            b.cell_box.lower[1],
            b.cell_box.upper[0],
            b.cell_box.upper[1]
        )?;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (opts, cfg) = parse_args()?;

    let out_dir = PathBuf::from("out").join("br_cluster").join(&opts.scenario);
    fs::create_dir_all(&out_dir)?;

    let n = opts.n as i32;
    let domain = IndexBox::new([0, 0], [n - 1, n - 1]);
    let tags = build_tags(&opts, domain)?;
    let tile = [opts.tile as i32; 2];
    let width = [opts.width; 2];

    RunConfig {
        cluster: cfg.clone(),
        scenario: ScenarioConfig {
            name: opts.scenario.clone(),
            n: opts.n,
            tile: opts.tile,
            n_ranks: opts.ranks,
            min_box: [opts.min_box; 2],
            efficiency_tol: opts.eff,
            combine_tol: opts.combine,
            relationship_width: opts.width,
        },
        run: RunInfo {
            binary: "br_cluster".to_string(),
            run_id: format!("{}_n{}_r{}", opts.scenario, opts.n, opts.ranks),
            git_commit: None,
        },
    }
    .write_to_dir(&out_dir)?;

    let t0 = Instant::now();
    let comms = ClusterComm::<2>::world(opts.ranks, cfg.comm_timeout());
    let results = run_on_ranks(comms, |comm| {
        let level = TagLevel::from_global(domain, &tags, tile, comm.rank(), opts.ranks)?;
        let mut br = BergerRigoutsos::<2, _>::new(cfg.clone())?;
        br.set_compute_relationships(RelationshipMode::Bidirectional, width)?;
        br.find_boxes_containing_tags(
            &comm,
            &level,
            0,
            1,
            &[domain],
            [opts.min_box; 2],
            opts.eff,
            opts.combine,
            width,
        )
    });
    let elapsed = t0.elapsed();

    let outputs = results.into_iter().collect::<Result<Vec<_>, _>>()?;
    let Some(first) = outputs.first() else {
        return Err("no ranks ran".into());
    };

    let tagged = tags.iter().filter(|&&t| t == 1).count() as u64;
    let covered: u64 = first.global_boxes.iter().map(|b| b.cell_box.volume()).sum();
    println!(
        "scenario={} n={} ranks={} boxes={} tagged={} covered={} efficiency={:.3} time={:.3}s",
        opts.scenario,
        opts.n,
        opts.ranks,
        first.global_boxes.len(),
        tagged,
        covered,
        if covered > 0 { tagged as f64 / covered as f64 } else { 0.0 },
        elapsed.as_secs_f64()
    );
    for (rank, o) in outputs.iter().enumerate() {
        println!(
            "  rank {rank}: owns {} boxes, nodes={} owned={} msgs sent={} recv={} tag->new edges={}",
            o.new_box_level.len(),
            o.stats.nodes_created,
            o.stats.nodes_owned,
            o.stats.messages_sent,
            o.stats.messages_received,
            o.tag_to_new.as_ref().map_or(0, |c| c.n_edges())
        );
    }

    write_boxes_csv(&out_dir.join("boxes.csv"), first)?;
    let stats: Vec<_> = outputs.iter().map(|o| &o.stats).collect();
    serde_json::to_writer_pretty(fs::File::create(out_dir.join("stats.json"))?, &stats)?;

    if opts.plot {
        let png = out_dir.join("boxes.png");
        save_cluster_plot(&domain, &tags, 1, &first.global_boxes, &png.to_string_lossy())?;
        println!("wrote {}", png.display());
    }

    Ok(())
}
