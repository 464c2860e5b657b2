/// Discrete PID controller around a zero setpoint.
///
/// The measured timing error is the process variable, so the control error is
/// its negation. The integral term starts at the neutral output and is
/// clamped to the output limits (anti-windup); the derivative acts on the
/// measurement, which avoids a kick when the error jumps.
#[derive(Debug, Clone, PartialEq)]
pub struct Pid {
    kp: f32,
    ki: f32,
    kd: f32,
    dt: f32,
    limits: (f32, f32),
    starting_output: f32,
    integral: f32,
    last_input: Option<f32>,
}

impl Pid {
    /// `dt` is the fixed interval between updates in seconds.
    pub fn new(kp: f32, ki: f32, kd: f32, dt: f32, limits: (f32, f32)) -> Self {
        let starting_output = 1.0f32.clamp(limits.0, limits.1);
        Self {
            kp,
            ki,
            kd,
            dt: if dt > 0.0 { dt } else { 1.0 },
            limits,
            starting_output,
            integral: starting_output,
            last_input: None,
        }
    }

    pub fn gains(&self) -> (f32, f32, f32) {
        (self.kp, self.ki, self.kd)
    }

    /// Feed one measurement and return the clamped output.
    pub fn update(&mut self, input: f32) -> f32 {
        let (lo, hi) = self.limits;
        let error = -input;
        let d_input = input - self.last_input.unwrap_or(input);

        let proportional = self.kp * error;
        self.integral = (self.integral + self.ki * error * self.dt).clamp(lo, hi);
        let derivative = -self.kd * d_input / self.dt;

        self.last_input = Some(input);
        (proportional + self.integral + derivative).clamp(lo, hi)
    }

    pub fn reset(&mut self) {
        self.integral = self.starting_output;
        self.last_input = None;
    }
}
