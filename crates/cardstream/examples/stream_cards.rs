use cardstream::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), CardStreamError> {
    cardstream::init_observability();
    let client = Client::from_env()?;
    let mut conversation = client.conversation(ConversationConfig::named("stream"));

    let mut stream = conversation
        .first_turn("Ideas for a retail banking app", "cards-ideas")
        .start_stream()
        .await?;

    while let Some(event) = stream.next_event().await {
        match event {
            StreamEvent::EntitiesUpdated { entities, .. } => {
                println!("{} cards", entities.len());
            }
            StreamEvent::UsageUpdated { totals, .. } => {
                println!("tokens so far: {}", totals.total());
            }
            StreamEvent::Failed { failure, .. } => eprintln!("turn failed: {}", failure.user_message()),
            _ => {}
        }
    }

    let outcome = stream.finish().await?;
    for entity in &outcome.entities {
        println!("{}\n", entity.to_text());
    }
    Ok(())
}
