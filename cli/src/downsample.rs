use clap::Args;
use eyre::{Result, WrapErr};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thinline::{read_points, write_points, Fingerprint, Format, Point, ResultCache};
use tokio::io::AsyncWriteExt as _;
use tracing::{error, info};

use crate::io::{create_output, open_input};

#[derive(Args, Debug)]
pub struct Opts {
    /// Number of points to keep per series (repeatable)
    #[clap(long, short = 't', required = true)]
    pub threshold: Vec<usize>,

    /// Output encoding (json, csv). With several inputs or thresholds,
    /// output is always one JSON record per series.
    #[clap(long, default_value = "json")]
    pub to: String,

    /// Sort each series by x before downsampling
    #[clap(long, default_value_t = false)]
    pub sort: bool,

    /// Output file [default: stdout]
    #[clap(long, default_value = "stdout")]
    pub output: String,

    /// Number of concurrent workers
    #[clap(long, env = "THINLINE_WORKERS", default_value_t = num_cpus::get())]
    pub workers: usize,

    /// Input files [default: stdin]
    pub files: Vec<String>,
}

struct Series {
    name: String,
    fingerprint: Fingerprint,
    points: Vec<Point>,
}

struct Job {
    seq: usize,
    series: Arc<Series>,
    threshold: usize,
}

struct Done {
    seq: usize,
    series: Arc<Series>,
    threshold: usize,
    result: thinline::Result<Arc<[Point]>>,
}

#[derive(Serialize)]
struct Record<'a> {
    source: &'a str,
    threshold: usize,
    points: &'a [Point],
}

pub async fn downsample(opts: &Opts, cache: Arc<ResultCache>) -> Result<()> {
    let format: Format = opts.to.parse()?;
    if opts.workers == 0 {
        eyre::bail!("--workers must be at least 1");
    }

    let sources: Vec<String> = if opts.files.is_empty() {
        vec!["stdin".to_string()]
    } else {
        opts.files.clone()
    };

    let mut series = Vec::with_capacity(sources.len());
    for source in &sources {
        let mut input = open_input(source).await?;
        let mut points = read_points(&mut input)
            .await
            .wrap_err_with(|| format!("reading {}", source))?;
        if opts.sort {
            // Stable, so points sharing an x keep their input order.
            points.sort_by(|a, b| a.x.total_cmp(&b.x));
        }
        info!(source = %source, points = points.len(), "loaded series");
        series.push(Arc::new(Series {
            name: source.clone(),
            fingerprint: fingerprint(&points),
            points,
        }));
    }

    let jobs: Vec<Job> = series
        .iter()
        .flat_map(|s| opts.threshold.iter().map(move |&t| (Arc::clone(s), t)))
        .enumerate()
        .map(|(seq, (series, threshold))| Job {
            seq,
            series,
            threshold,
        })
        .collect();
    let total = jobs.len();
    let single = total == 1;
    if !single && format == Format::Csv {
        eyre::bail!("csv output supports a single input and threshold, use --to json");
    }

    let (job_send, job_recv) = async_channel::bounded::<Job>(1);
    let (done_send, done_recv) = async_channel::unbounded::<Done>();

    for _ in 0..opts.workers.min(total) {
        tokio::spawn(worker(
            job_recv.clone(),
            done_send.clone(),
            Arc::clone(&cache),
        ));
    }
    // The results channel closes once every worker has exited.
    drop(done_send);

    tokio::spawn(async move {
        for job in jobs {
            if job_send.send(job).await.is_err() {
                break;
            }
        }
    });

    let mut output = create_output(&opts.output).await?;
    let mut pending: BTreeMap<usize, Done> = BTreeMap::new();
    let mut next = 0;
    let mut failed = 0;

    // Workers finish out of order; results are written in submission order.
    while let Ok(done) = done_recv.recv().await {
        pending.insert(done.seq, done);
        while let Some(done) = pending.remove(&next) {
            next += 1;
            match &done.result {
                Ok(points) => {
                    info!(
                        source = %done.series.name,
                        threshold = done.threshold,
                        from = done.series.points.len(),
                        to = points.len(),
                        "downsampled"
                    );
                    if single {
                        write_points(&mut output, format, points).await?;
                    } else {
                        let record = Record {
                            source: &done.series.name,
                            threshold: done.threshold,
                            points: &points[..],
                        };
                        let mut line = serde_json::to_vec(&record)?;
                        line.push(b'\n');
                        output.write_all(&line).await?;
                    }
                }
                Err(err) => {
                    failed += 1;
                    error!(
                        source = %done.series.name,
                        threshold = done.threshold,
                        error = %err,
                        "cannot downsample"
                    );
                }
            }
        }
    }
    output.flush().await?;

    let stats = cache.stats();
    info!(
        entries = stats.entries,
        hits = stats.hits,
        misses = stats.misses,
        coalesced = stats.coalesced,
        evictions = stats.evictions,
        "cache stats"
    );

    if failed > 0 {
        eyre::bail!("{} of {} series could not be downsampled", failed, total);
    }
    Ok(())
}

async fn worker(
    jobs: async_channel::Receiver<Job>,
    done: async_channel::Sender<Done>,
    cache: Arc<ResultCache>,
) {
    while let Ok(job) = jobs.recv().await {
        let result = cache
            .downsample(job.series.fingerprint, &job.series.points, job.threshold)
            .await;
        let _ = done
            .send(Done {
                seq: job.seq,
                series: job.series,
                threshold: job.threshold,
                result,
            })
            .await;
    }
}

// Content fingerprint: identical inputs share cache entries.
fn fingerprint(points: &[Point]) -> Fingerprint {
    let mut hasher = DefaultHasher::new();
    points.len().hash(&mut hasher);
    for p in points {
        p.x.to_bits().hash(&mut hasher);
        p.y.to_bits().hash(&mut hasher);
    }
    Fingerprint::new(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_tracks_content() {
        let a = vec![Point::new(0.0, 1.0), Point::new(1.0, 2.0)];
        let b = a.clone();
        let mut c = a.clone();
        c[1].y = 2.5;

        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
        assert_ne!(fingerprint(&a), fingerprint(&a[..1]));
    }

    async fn scratch(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("thinline-{}-{}", name, std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        dir
    }

    fn opts(threshold: Vec<usize>, to: &str, output: &std::path::Path) -> Opts {
        Opts {
            threshold,
            to: to.to_string(),
            sort: false,
            output: output.to_string_lossy().into_owned(),
            workers: 2,
            files: Vec::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_inputs_share_one_computation() {
        let dir = scratch("shared").await;

        let body: String = (0..200)
            .map(|i| format!("{},{}\n", i, (i * 37) % 11))
            .collect();
        let a = dir.join("a.csv");
        let b = dir.join("b.csv");
        tokio::fs::write(&a, &body).await.unwrap();
        tokio::fs::write(&b, &body).await.unwrap();
        let out = dir.join("out.jsonl");

        let mut opts = opts(vec![20], "json", &out);
        opts.files = vec![
            a.to_string_lossy().into_owned(),
            b.to_string_lossy().into_owned(),
        ];
        let cache = Arc::new(ResultCache::default());
        downsample(&opts, Arc::clone(&cache)).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits + stats.coalesced, 1);

        let written = tokio::fs::read_to_string(&out).await.unwrap();
        let lines: Vec<serde_json::Value> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["source"], &*a.to_string_lossy());
        assert_eq!(lines[1]["source"], &*b.to_string_lossy());
        assert_eq!(lines[0]["points"].as_array().unwrap().len(), 20);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn sort_is_stable_on_equal_x() {
        let dir = scratch("sort").await;
        let input = dir.join("in.csv");
        tokio::fs::write(&input, "3,0\n1,5\n1,6\n2,0\n1,7\n")
            .await
            .unwrap();
        let out = dir.join("out.jsonl");

        let mut opts = opts(vec![10], "json", &out);
        opts.files = vec![input.to_string_lossy().into_owned()];
        let cache = Arc::new(ResultCache::default());

        // Out of order input is rejected unless sorted first.
        assert!(downsample(&opts, Arc::clone(&cache)).await.is_err());

        opts.sort = true;
        downsample(&opts, cache).await.unwrap();
        let written = tokio::fs::read_to_string(&out).await.unwrap();
        let points: Vec<Point> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            points,
            vec![
                Point::new(1.0, 5.0),
                Point::new(1.0, 6.0),
                Point::new(1.0, 7.0),
                Point::new(2.0, 0.0),
                Point::new(3.0, 0.0),
            ]
        );

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn csv_output_needs_a_single_job() {
        let dir = scratch("csv").await;
        let input = dir.join("in.csv");
        tokio::fs::write(&input, "0,0\n1,1\n2,0\n3,1\n").await.unwrap();
        let out = dir.join("out.csv");

        let mut opts = opts(vec![2, 3], "csv", &out);
        opts.files = vec![input.to_string_lossy().into_owned()];
        let cache = Arc::new(ResultCache::default());
        let err = downsample(&opts, Arc::clone(&cache)).await.unwrap_err();
        assert!(err.to_string().contains("csv output"));
        assert_eq!(cache.stats().misses, 0);

        opts.threshold = vec![2];
        downsample(&opts, cache).await.unwrap();
        let written = tokio::fs::read_to_string(&out).await.unwrap();
        assert_eq!(written, "0.0,0.0\n3.0,1.0\n");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_job_fails_the_run_and_keeps_the_rest() {
        let dir = scratch("failed").await;
        let bad = dir.join("bad.csv");
        let good = dir.join("good.csv");
        tokio::fs::write(&bad, "0,1\n1,NaN\n2,3\n").await.unwrap();
        tokio::fs::write(&good, "0,1\n1,4\n2,3\n").await.unwrap();
        let out = dir.join("out.jsonl");

        let mut opts = opts(vec![2], "json", &out);
        opts.files = vec![
            bad.to_string_lossy().into_owned(),
            good.to_string_lossy().into_owned(),
        ];
        let cache = Arc::new(ResultCache::default());
        let err = downsample(&opts, Arc::clone(&cache)).await.unwrap_err();
        assert!(err.to_string().contains("1 of 2"));
        assert_eq!(cache.len(), 1);

        let written = tokio::fs::read_to_string(&out).await.unwrap();
        let lines: Vec<serde_json::Value> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["source"], &*good.to_string_lossy());
        assert_eq!(lines[0]["threshold"], 2);
        assert_eq!(lines[0]["points"].as_array().unwrap().len(), 2);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
