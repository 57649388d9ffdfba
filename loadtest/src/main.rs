use goose::prelude::*;
use rand::Rng;

/// Load testing suite for the tmdb-edge proxy.
///
/// Simulates the traffic mix a media client produces:
/// - Hot API lookups (served from the in-memory cache after warmup)
/// - Cold API lookups across many ids (upstream round trips)
/// - Popular posters (edge cache hits)
/// - Long-tail posters (edge cache misses)
///
/// # Usage
/// ```bash
/// cd loadtest
/// TMDB_API_KEY=... cargo run --release -- \
///     --host http://localhost:8080 --users 10 --hatch-rate 2 --run-time 60s
/// ```
///
/// # Performance Targets
/// - API cache hits: <10ms p95 latency
/// - Image cache hits: <20ms p95 latency
/// - Misses: bounded by upstream latency
/// - Error rate: <1%

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("ApiProxy")
                // Same key every time: exercises the in-memory cache
                .register_transaction(transaction!(hot_movie).set_weight(10)?)
                // Spread across ids: exercises upstream fetch and eviction
                .register_transaction(transaction!(random_movie).set_weight(3)?)
        )
        .register_scenario(
            scenario!("ImageProxy")
                .register_transaction(transaction!(popular_poster).set_weight(15)?)
                .register_transaction(transaction!(long_tail_poster).set_weight(5)?)
        )
        .execute()
        .await?;

    Ok(())
}

fn api_key() -> String {
    std::env::var("TMDB_API_KEY").unwrap_or_else(|_| "loadtest".to_string())
}

/// Repeats one lookup so every request after the first is a cache hit.
async fn hot_movie(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get(&format!("/3/movie/550?api_key={}", api_key())).await?;
    Ok(())
}

/// Randomized ids keep the API cache churning.
async fn random_movie(user: &mut GooseUser) -> TransactionResult {
    // Generate random parameters before await to satisfy Send bounds
    let url = {
        let mut rng = rand::thread_rng();
        let id = rng.gen_range(1..100_000);
        let languages = ["en-US", "zh-CN", "ja-JP"];
        let language = languages[rng.gen_range(0..languages.len())];
        format!("/3/movie/{}?api_key={}&language={}", id, api_key(), language)
    };

    let _goose = user.get(&url).await?;
    Ok(())
}

/// A fixed poster path: edge cache hit after warmup.
async fn popular_poster(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get("/t/p/w500/pB8BM7pdSp6B6Ih7QZ4DrQ3PmJK.jpg").await?;
    Ok(())
}

/// Varying sizes of the same poster: mostly edge cache misses.
async fn long_tail_poster(user: &mut GooseUser) -> TransactionResult {
    let url = {
        let mut rng = rand::thread_rng();
        let sizes = ["w92", "w154", "w185", "w342", "w780", "original"];
        let size = sizes[rng.gen_range(0..sizes.len())];
        format!("/t/p/{}/pB8BM7pdSp6B6Ih7QZ4DrQ3PmJK.jpg", size)
    };

    let _goose = user.get(&url).await?;
    Ok(())
}
