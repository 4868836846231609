use dircol::*;

const MASS: f64 = 2.0;
const N: usize = 30;

// move a block 1 m in 1 s and stop it there, with least squared force
struct SlidingMass;

impl Dynamics for SlidingMass {
    fn calc<'t>(
        &self,
        input: &ContinuousInput<'_, 't>,
        derivatives: &mut [Var<'t>],
    ) -> Result<(), UserError> {
        derivatives[0] = input.states[1];
        derivatives[1] = input.controls[0] / MASS;
        Ok(())
    }
}

struct Effort;

impl IntegralCost for Effort {
    fn calc<'t>(&self, input: &ContinuousInput<'_, 't>) -> Result<Var<'t>, UserError> {
        Ok(input.controls[0].powi(2))
    }
}

fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    let mut problem = Problem::new();
    problem.set_time_bounds(Bounds::fixed(0.0), Bounds::fixed(1.0))?;
    problem.add_state(
        "position",
        StateType::Coordinate,
        Bounds::new(-5.0, 5.0),
        Bounds::fixed(0.0),
        Bounds::fixed(1.0),
    )?;
    problem.add_state(
        "speed",
        StateType::Speed,
        Bounds::new(-50.0, 50.0),
        Bounds::fixed(0.0),
        Bounds::fixed(0.0),
    )?;
    problem.add_control(
        "force",
        Bounds::new(-100.0, 100.0),
        Bounds::unset(),
        Bounds::unset(),
    )?;
    problem.set_dynamics_function(SlidingMass)?;
    problem.set_integral_cost_function(Effort)?;
    problem.initialize()?;

    let mut solver = Solver::new(&problem)?;
    solver.set_num_mesh_points(N)?;
    solver.set_scheme("trapezoidal")?;
    solver.set_option("tolerance", "1e-7");
    let guess = solver.create_initial_guess_from_bounds()?;
    let solution = solver.solve(&guess)?;

    println!(
        "{} (success: {}), {} iterations, objective {:.4}, violation {:.2e}",
        solution.status,
        solution.success,
        solution.num_iterations,
        solution.stats.objective,
        solution.stats.constraint_violation
    );

    std::fs::create_dir_all("logs")?;
    let mut wtr = csv::Writer::from_path("logs/sliding_mass.csv")?;
    wtr.write_record(["time", "position", "speed", "force"])?;
    let states = solution.variable(Variable::States);
    let controls = solution.variable(Variable::Controls);
    for (k, t) in solution.times().iter().enumerate() {
        wtr.write_record(&[
            t.to_string(),
            states[(0, k)].to_string(),
            states[(1, k)].to_string(),
            controls[(0, k)].to_string(),
        ])?;
    }
    wtr.flush()?;

    Ok(())
}
