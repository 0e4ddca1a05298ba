//! Feeds canned chunks through a `SessionController` without any network.

use cardstream::{MergeMode, SessionController, StreamEvent, TurnSpec};

fn main() {
    let chunks = [
        "Here you go:\n[{\"title\":\"Budget",
        " coach\",\"summary\":\"Monthly spending nudges\"},[EVENT]{\"type\":\"tok",
        "en_usage\",\"data\":{\"input_tokens\":120,\"output_tokens\":40}}[/EVENT]",
        "{\"title\":\"Round-ups\",\"summary\":\"Save the change\"}]",
    ];

    let mut controller = SessionController::new();
    let (ticket, mut events) = controller.begin(TurnSpec::cards(MergeMode::Replace));
    for chunk in chunks {
        events.extend(controller.apply_chunk(ticket.generation, chunk.into()));
    }
    events.extend(controller.finish(ticket.generation));

    for event in events {
        match event {
            StreamEvent::EntitiesUpdated { entities, .. } => println!("{} cards", entities.len()),
            StreamEvent::UsageUpdated { totals, .. } => println!("{totals:?}"),
            StreamEvent::Completed { outcome, .. } => println!("completed, {} new", outcome.added),
            other => println!("{other:?}"),
        }
    }
}
