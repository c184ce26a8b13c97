use stockshift_core::Aggregate;

/// Decide and evolve in one step: run `handle`, then `apply` every emitted
/// event to the aggregate.
///
/// On error the aggregate is left untouched.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: Aggregate,
{
    let events = aggregate.handle(command)?;
    for event in &events {
        aggregate.apply(event);
    }
    Ok(events)
}
