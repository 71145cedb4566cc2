use anyhow::{Context, Result};

use mystery_host::dm::SpeakContext;
use mystery_host::game::{Game, list_game_dirs};
use mystery_host::session::GameSession;
use mystery_host::{AiClient, ImageJobClient, Settings, logging};

/// Async job endpoint of the image service; distinct from the
/// OpenAI-compatible chat base URL.
const IMAGE_API_BASE: &str = "https://dashscope.aliyuncs.com/api/v1";

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load();
    if let Err(e) = logging::init(&settings.data_dir) {
        eprintln!("logging unavailable: {e}");
    }

    let Some(api_key) = settings.api_key.clone() else {
        eprintln!("No API key configured.");
        eprintln!("Set API_KEY in the environment, or put \"api_key\" into ./data/settings.json.");
        std::process::exit(1);
    };

    let gateway = AiClient::new(&settings).context("building the chat client")?;
    let image_backend = ImageJobClient::new(IMAGE_API_BASE, &api_key, &settings.image_model);

    // Reopen the configured game directory if one is set, otherwise the most
    // recent game on disk, otherwise generate a fresh one.
    let game = if let Some(path) = &settings.default_script_path {
        Game::load(std::path::Path::new(path), gateway.clone(), image_backend)?
    } else if let Some(latest) = list_game_dirs(&settings.data_dir).pop() {
        Game::load(&latest, gateway.clone(), image_backend)?
    } else {
        println!("Generating a new mystery, this takes a while...");
        Game::create(&settings, gateway.clone(), image_backend).await?
    };

    println!(
        "Hosting '{}' with {} characters over {} chapters ({})",
        game.script().title,
        game.script().characters.len(),
        game.script().total_chapters(),
        game.game_dir().display()
    );

    // Headless run: every seat is AI-controlled.
    let total_chapters = game.script().total_chapters();
    let mut session = GameSession::new(game, gateway);
    let opening = session.start().await?;
    println!("\n## DM\n\n{}", opening.speech);

    for chapter in 1..=total_chapters {
        for _cycle in 0..settings.chapter_cycles {
            for character in session.game().script().characters.clone() {
                let answers = session
                    .ai_take_turn(&character)
                    .await
                    .context("running an ai turn")?;
                for answer in answers {
                    println!("{} -> {}: {}", answer.target, answer.asker, answer.answer);
                }
                if let Some(reply) = session.maybe_dm_interject().await {
                    println!("\n## DM\n\n{}", reply.speech);
                } else {
                    session.maybe_dm_ack();
                }
            }
            session.sync_cycle();
        }
        if chapter < total_chapters {
            let reply = session.next_chapter().await?;
            println!("\n## DM\n\n{}", reply.speech);
        }
    }

    let reveal = session.end(SpeakContext::default()).await?;
    println!("\n## DM\n\n{}", reveal.speech);

    let transcript_path = session.game().game_dir().join("transcript.md");
    std::fs::write(&transcript_path, session.log().render_markdown())?;
    println!("\nTranscript saved to {}", transcript_path.display());
    Ok(())
}
