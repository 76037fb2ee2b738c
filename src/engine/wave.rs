//! 波形生成
//!
//! 每个声道独立的振荡器：波形、幅度（dB）、频率、初相

use std::f64::consts::TAU;
use std::str::FromStr;

/// 波形
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaveShape {
    Sine,
    Triangle,
    /// 占空比 0.0-1.0
    Square(f64),
    Sawtooth,
}

impl WaveShape {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sine => "Sine",
            Self::Triangle => "Triangle",
            Self::Square(_) => "Square",
            Self::Sawtooth => "Sawtooth",
        }
    }

    /// 相位 p（弧度，非负）处的波形值，范围 [-1, 1]
    #[inline]
    fn sample(&self, p: f64) -> f64 {
        match *self {
            Self::Sine => p.sin(),
            Self::Triangle => match (p / TAU).fract() * 4. {
                x if x < 1. => x,
                x if x < 3. => 2. - x,
                x => x - 4.,
            },
            Self::Square(duty) => {
                if (p / TAU).fract() < duty {
                    1.
                } else {
                    -1.
                }
            }
            Self::Sawtooth => (p / TAU).fract().mul_add(-2., 1.),
        }
    }
}

impl Default for WaveShape {
    fn default() -> Self {
        Self::Sine
    }
}

/// 参数解析错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamsError {
    #[error("unknown wave shape '{0}' (expected sine, triangle, square[:DUTY], saw)")]
    UnknownShape(String),

    #[error("invalid {field} '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("square duty cycle must be within 0.0..=1.0, got {0}")]
    DutyOutOfRange(f64),

    #[error("frequency must be finite and non-negative, got {0}")]
    InvalidFrequency(f64),

    #[error("too many fields in '{0}' (expected SHAPE[,FREQ[,AMP_DB[,PHASE_DEG]]])")]
    TooManyFields(String),
}

fn parse_number(field: &'static str, value: &str) -> Result<f64, ParamsError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParamsError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

impl FromStr for WaveShape {
    type Err = ParamsError;

    /// `sine` | `triangle` | `square[:DUTY]` | `saw` | `sawtooth`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s.as_str(), None),
        };

        match (name, arg) {
            ("sine", None) => Ok(Self::Sine),
            ("triangle", None) => Ok(Self::Triangle),
            ("saw" | "sawtooth", None) => Ok(Self::Sawtooth),
            ("square", None) => Ok(Self::Square(0.5)),
            ("square", Some(duty)) => {
                let duty = parse_number("duty cycle", duty)?;
                if !(0.0..=1.0).contains(&duty) {
                    return Err(ParamsError::DutyOutOfRange(duty));
                }
                Ok(Self::Square(duty))
            }
            _ => Err(ParamsError::UnknownShape(s.clone())),
        }
    }
}

/// 声道参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelParams {
    pub shape: WaveShape,
    pub amplitude_db: f64,
    pub frequency: f64,
    pub phase_degrees: f64,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            shape: WaveShape::default(),
            amplitude_db: 0.,
            frequency: 1e3,
            phase_degrees: 0.,
        }
    }
}

impl FromStr for ChannelParams {
    type Err = ParamsError;

    /// `SHAPE[,FREQ[,AMP_DB[,PHASE_DEG]]]`，省略的字段取默认值
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(',');
        let mut params = ChannelParams {
            shape: fields.next().unwrap_or_default().parse()?,
            ..Default::default()
        };

        if let Some(freq) = fields.next() {
            params.frequency = parse_number("frequency", freq)?;
            if params.frequency < 0. {
                return Err(ParamsError::InvalidFrequency(params.frequency));
            }
        }
        if let Some(amp) = fields.next() {
            params.amplitude_db = parse_number("amplitude", amp)?;
        }
        if let Some(phase) = fields.next() {
            params.phase_degrees = parse_number("phase", phase)?;
        }
        if fields.next().is_some() {
            return Err(ParamsError::TooManyFields(s.to_string()));
        }

        Ok(params)
    }
}

impl std::fmt::Display for ChannelParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:.1} Hz {:+.1} dB {:.0}°",
            self.shape.name(),
            self.frequency,
            self.amplitude_db,
            self.phase_degrees
        )?;
        if let WaveShape::Square(duty) = self.shape {
            write!(f, " (duty {:.2})", duty)?;
        }
        Ok(())
    }
}

/// 单声道振荡器
#[derive(Default, Debug)]
pub struct Channel {
    params: ChannelParams,
    /// 已生成的样本数
    t: u32,
}

impl Channel {
    pub fn params(&self) -> &ChannelParams {
        &self.params
    }

    /// 填充一个声道的样本块
    ///
    /// 不分配、不加锁，可在实时线程调用
    pub fn process(&mut self, buf: &mut [f32], rate: f64) {
        let params = &self.params;
        let amp = 10f64.powf(params.amplitude_db / 20.);
        // 初相归一化到 [0, 360)，保证相位非负
        let theta = params.phase_degrees.rem_euclid(360.).to_radians();
        let w = if rate > 0. {
            params.frequency * TAU / rate
        } else {
            0.
        };

        for b in buf {
            let p = (self.t as f64).mul_add(w, theta);
            self.t = self.t.wrapping_add(1);
            *b = (params.shape.sample(p) * amp) as f32;
        }
    }

    pub fn reset(&mut self) {
        self.t = 0;
    }
}

impl From<ChannelParams> for Channel {
    fn from(params: ChannelParams) -> Self {
        Self { params, t: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    fn render(params: ChannelParams, n: usize, rate: f64) -> Vec<f32> {
        let mut channel = Channel::from(params);
        let mut buf = vec![0f32; n];
        channel.process(&mut buf, rate);
        buf
    }

    #[test]
    fn test_sine_quarter_period() {
        // 4 样本一个周期：0, 1, 0, -1
        let params = ChannelParams {
            frequency: 1.,
            ..Default::default()
        };
        let buf = render(params, 4, 4.);
        let expected = [0., 1., 0., -1.];
        for (got, want) in buf.iter().zip(expected) {
            assert!((got - want).abs() < EPS, "{} != {}", got, want);
        }
    }

    #[test]
    fn test_phase_offset() {
        let params = ChannelParams {
            frequency: 1.,
            phase_degrees: 90.,
            ..Default::default()
        };
        let buf = render(params, 1, 4.);
        assert!((buf[0] - 1.).abs() < EPS);

        // 负相位等价于补角
        let params = ChannelParams {
            frequency: 1.,
            phase_degrees: -270.,
            ..Default::default()
        };
        let buf = render(params, 1, 4.);
        assert!((buf[0] - 1.).abs() < EPS);
    }

    #[test]
    fn test_amplitude_db() {
        let params = ChannelParams {
            frequency: 1.,
            amplitude_db: -20.,
            ..Default::default()
        };
        let buf = render(params, 2, 4.);
        assert!((buf[1] - 0.1).abs() < EPS);
    }

    #[test]
    fn test_square_duty() {
        let params = ChannelParams {
            shape: WaveShape::Square(0.25),
            frequency: 1.,
            ..Default::default()
        };
        let buf = render(params, 8, 8.);
        assert_eq!(buf, [1., 1., -1., -1., -1., -1., -1., -1.]);
    }

    #[test]
    fn test_sawtooth_and_triangle() {
        let saw = ChannelParams {
            shape: WaveShape::Sawtooth,
            frequency: 1.,
            ..Default::default()
        };
        let buf = render(saw, 4, 4.);
        let expected = [1., 0.5, 0., -0.5];
        for (got, want) in buf.iter().zip(expected) {
            assert!((got - want).abs() < EPS);
        }

        let tri = ChannelParams {
            shape: WaveShape::Triangle,
            frequency: 1.,
            ..Default::default()
        };
        let buf = render(tri, 8, 8.);
        let expected = [0., 0.5, 1., 0.5, 0., -0.5, -1., -0.5];
        for (got, want) in buf.iter().zip(expected) {
            assert!((got - want).abs() < EPS, "{} != {}", got, want);
        }
    }

    #[test]
    fn test_reset_restarts_phase() {
        let mut channel = Channel::from(ChannelParams {
            shape: WaveShape::Sawtooth,
            frequency: 1.,
            ..Default::default()
        });
        let mut first = [0f32; 3];
        channel.process(&mut first, 4.);
        channel.reset();
        let mut second = [0f32; 3];
        channel.process(&mut second, 4.);
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_shape() {
        assert_eq!("sine".parse::<WaveShape>(), Ok(WaveShape::Sine));
        assert_eq!("Square".parse::<WaveShape>(), Ok(WaveShape::Square(0.5)));
        assert_eq!("square:0.1".parse::<WaveShape>(), Ok(WaveShape::Square(0.1)));
        assert_eq!("saw".parse::<WaveShape>(), Ok(WaveShape::Sawtooth));
        assert!(matches!(
            "square:2".parse::<WaveShape>(),
            Err(ParamsError::DutyOutOfRange(_))
        ));
        assert!(matches!(
            "noise".parse::<WaveShape>(),
            Err(ParamsError::UnknownShape(_))
        ));
    }

    #[test]
    fn test_parse_params() {
        let p: ChannelParams = "triangle,440,-6,90".parse().unwrap();
        assert_eq!(p.shape, WaveShape::Triangle);
        assert_eq!(p.frequency, 440.);
        assert_eq!(p.amplitude_db, -6.);
        assert_eq!(p.phase_degrees, 90.);

        let p: ChannelParams = "sine".parse().unwrap();
        assert_eq!(p, ChannelParams::default());

        assert!("sine,abc".parse::<ChannelParams>().is_err());
        assert!("sine,-1".parse::<ChannelParams>().is_err());
        assert!("sine,1,2,3,4".parse::<ChannelParams>().is_err());
    }
}
