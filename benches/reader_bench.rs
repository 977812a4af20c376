use std::collections::HashMap;
use std::hint::black_box;
use std::time::Instant;

use calico::layout::{count_words, paginate, split_block_units};
use calico::{parse_metadata, parse_spine_order, plan_with_sizes, PaginationConfig};

const WARMUP_ITERS: usize = 3;
const MEASURE_ITERS: usize = 20;

struct CaseResult {
    case: &'static str,
    min: u128,
    median: u128,
    p90: u128,
    mean: u128,
    max: u128,
}

fn percentile(sorted: &[u128], percentile: f64) -> u128 {
    let idx = ((sorted.len().saturating_sub(1) as f64) * percentile).round() as usize;
    sorted[idx]
}

fn run_case<F>(case: &'static str, mut op: F) -> CaseResult
where
    F: FnMut() -> usize,
{
    for _ in 0..WARMUP_ITERS {
        black_box(op());
    }

    let mut samples = Vec::with_capacity(MEASURE_ITERS);
    for _ in 0..MEASURE_ITERS {
        let start = Instant::now();
        black_box(op());
        samples.push(start.elapsed().as_nanos());
    }
    samples.sort_unstable();

    let sum: u128 = samples.iter().copied().sum();
    CaseResult {
        case,
        min: samples[0],
        median: percentile(&samples, 0.5),
        p90: percentile(&samples, 0.9),
        mean: sum / samples.len() as u128,
        max: samples[samples.len() - 1],
    }
}

fn synthetic_chapter(paragraphs: usize, words: usize) -> String {
    let mut markup = String::from("<html><head><title>Bench</title></head><body>\n");
    for p in 0..paragraphs {
        markup.push_str(if p % 7 == 0 { "<h2>" } else { "<p>" });
        for w in 0..words {
            markup.push_str("word");
            markup.push_str(&(p * words + w).to_string());
            markup.push(' ');
        }
        markup.push_str(if p % 7 == 0 { "</h2>\n" } else { "</p>\n" });
    }
    markup.push_str("</body></html>");
    markup
}

fn synthetic_package(chapters: usize) -> String {
    let mut opf = String::from(
        "<?xml version=\"1.0\"?><package xmlns=\"http://www.idpf.org/2007/opf\">\
         <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\
         <dc:title>Bench Book</dc:title><dc:creator>Bench Author</dc:creator>\
         <dc:subject>Fiction</dc:subject></metadata><manifest>",
    );
    for i in 0..chapters {
        opf.push_str(&format!(
            "<item id=\"c{i}\" href=\"text/c{i}.xhtml\" media-type=\"application/xhtml+xml\"/>"
        ));
    }
    opf.push_str("</manifest><spine>");
    for i in 0..chapters {
        opf.push_str(&format!("<itemref idref=\"c{i}\"/>"));
    }
    opf.push_str("</spine></package>");
    opf
}

fn main() {
    println!("# calico benchmark (synthetic input)");
    println!(
        "# warmup_iters={}, measure_iters={}",
        WARMUP_ITERS, MEASURE_ITERS
    );
    println!("case,iterations,min_ns,median_ns,p90_ns,mean_ns,max_ns");

    let package = synthetic_package(2000);
    let spine = parse_spine_order(package.as_bytes(), "OEBPS/content.opf")
        .expect("synthetic spine must parse");
    let sizes: HashMap<String, u64> = spine
        .iter()
        .enumerate()
        .map(|(i, path)| (path.clone(), 2_000 + (i as u64 * 7_919) % 60_000))
        .collect();
    let chapter = synthetic_chapter(400, 40);
    let budget = PaginationConfig::default().words_per_page();

    let results = [
        run_case("structure/parse_metadata", || {
            let meta = parse_metadata(package.as_bytes()).expect("metadata");
            meta.genres.len()
        }),
        run_case("structure/parse_spine_2000", || {
            parse_spine_order(package.as_bytes(), "OEBPS/content.opf")
                .expect("spine")
                .len()
        }),
        run_case("chunk/plan_2000_chapters", || {
            plan_with_sizes(&spine, &sizes, calico::DEFAULT_MAX_CHUNK_BYTES).len()
        }),
        run_case("layout/count_words_16k", || count_words(&chapter)),
        run_case("layout/split_block_units", || split_block_units(&chapter).len()),
        run_case("layout/paginate_16k_words", || {
            paginate(&chapter, budget, 0).len()
        }),
    ];

    for result in &results {
        println!(
            "{},{},{},{},{},{},{}",
            result.case,
            MEASURE_ITERS,
            result.min,
            result.median,
            result.p90,
            result.mean,
            result.max
        );
    }
}
