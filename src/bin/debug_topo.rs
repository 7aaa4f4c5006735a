use fibersched::{PinningStrategy, topology};

fn main() {
    let cores = topology::available_cores();
    println!("Logical cores:  {}", topology::logical_core_count());
    println!("Physical cores: {}", topology::physical_core_count());
    println!("SMT enabled:    {}", topology::has_smt());
    println!("Affinity IDs:   {:?}", cores.iter().map(|c| c.id).collect::<Vec<_>>());

    for strategy in [
        PinningStrategy::None,
        PinningStrategy::Linear,
        PinningStrategy::AvoidSMT,
    ] {
        match topology::select_cores(strategy, None) {
            Ok(selected) => {
                let ids: Vec<_> = selected
                    .iter()
                    .map(|core| core.map(|c| c.id))
                    .collect();
                println!("{strategy:?} -> {} workers: {ids:?}", ids.len());
            }
            Err(err) => println!("{strategy:?} -> error: {err}"),
        }
    }
}
