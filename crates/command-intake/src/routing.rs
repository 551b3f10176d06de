//! Weighted choice between active routes.

use dispatch_database::CommandRoute;
use rand::Rng;

/// Pick one route, with probability proportional to its weight.
///
/// Zero-weight routes are drained: they are never picked while any route
/// has a positive weight. If every weight is zero the first route wins.
pub fn choose_route<'a, R: Rng + ?Sized>(routes: &'a [CommandRoute], rng: &mut R) -> Option<&'a CommandRoute> {
    let total: u64 = routes.iter().map(|r| u64::from(r.weight)).sum();
    if total == 0 {
        return routes.first();
    }

    let mut roll = rng.gen_range(0..total);
    for route in routes {
        let weight = u64::from(route.weight);
        if roll < weight {
            return Some(route);
        }
        roll -= weight;
    }

    routes.last()
}
