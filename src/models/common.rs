use serde::{Deserialize, Serialize};

/// ローカル直交座標系（ENU）における3次元位置
///
/// x = 東, y = 北, z = 上（基準高度からの差）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position3D {
    pub x: f64, // m (East)
    pub y: f64, // m (North)
    pub z: f64, // m (Up)
}

impl Position3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// 3次元距離を計算
    pub fn distance_3d(&self, other: &Position3D) -> f64 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// 3次元速度を表す構造体（ENU, m/s）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity3D {
    pub x: f64, // m/s
    pub y: f64, // m/s
    pub z: f64, // m/s
}

impl Velocity3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// 速度ベクトルの大きさ
    pub fn magnitude(&self) -> f64 {
        (self.x.powi(2) + self.y.powi(2) + self.z.powi(2)).sqrt()
    }

    /// XY平面での速度の大きさ
    pub fn magnitude_xy(&self) -> f64 {
        (self.x.powi(2) + self.y.powi(2)).sqrt()
    }
}

/// 機体軸角速度（p, q, r, rad/s）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AngularVelocity {
    pub p: f64, // roll rate
    pub q: f64, // pitch rate
    pub r: f64, // yaw rate
}

impl AngularVelocity {
    pub fn new(p: f64, q: f64, r: f64) -> Self {
        Self { p, q, r }
    }
}

/// 機体姿勢（オイラー角、度）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    /// ロール角（右翼下げが正）
    pub roll: f64,
    /// ピッチ角（機首上げが正）
    pub pitch: f64,
    /// ヨー角（0=北, 90=東）
    pub yaw: f64,
}

impl Orientation {
    pub fn new(roll: f64, pitch: f64, yaw: f64) -> Self {
        Self { roll, pitch, yaw }
    }

    /// 速度ベクトルから姿勢を計算
    ///
    /// 速度ベクトルの方向からピッチ角とヨー角を計算します。
    /// ヨー角は北基準・時計回り（0〜360度）です。
    ///
    /// # 引数
    ///
    /// * `velocity` - 姿勢計算の基準となる速度ベクトル
    /// * `roll` - 与えるロール角（度）
    pub fn from_velocity(velocity: &Velocity3D, roll: f64) -> Self {
        let speed_xy = velocity.magnitude_xy();
        let pitch = if speed_xy > 0.0 {
            math_utils::rad_to_deg(velocity.z.atan2(speed_xy))
        } else {
            0.0
        };

        let yaw = if velocity.x.abs() > 1e-10 || velocity.y.abs() > 1e-10 {
            math_utils::normalize_heading(math_utils::rad_to_deg(velocity.x.atan2(velocity.y)))
        } else {
            0.0
        };

        Self::new(roll, pitch, yaw)
    }
}

/// 数学ユーティリティ関数
pub mod math_utils {
    /// 度をラジアンに変換
    pub fn deg_to_rad(degrees: f64) -> f64 {
        degrees * std::f64::consts::PI / 180.0
    }

    /// ラジアンを度に変換
    pub fn rad_to_deg(radians: f64) -> f64 {
        radians * 180.0 / std::f64::consts::PI
    }

    /// 方位角を0度〜360度未満の範囲に正規化
    pub fn normalize_heading(heading_deg: f64) -> f64 {
        let normalized = heading_deg % 360.0;
        if normalized < 0.0 {
            normalized + 360.0
        } else {
            normalized
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orientation_from_velocity_heading_convention() {
        // 東向き
        let east = Orientation::from_velocity(&Velocity3D::new(10.0, 0.0, 0.0), 0.0);
        assert!((east.yaw - 90.0).abs() < 1e-9);
        assert!(east.pitch.abs() < 1e-9);

        // 南向き・上昇
        let south_climb = Orientation::from_velocity(&Velocity3D::new(0.0, -10.0, 10.0), 5.0);
        assert!((south_climb.yaw - 180.0).abs() < 1e-9);
        assert!((south_climb.pitch - 45.0).abs() < 1e-9);
        assert_eq!(south_climb.roll, 5.0);
    }

    #[test]
    fn test_normalize_heading() {
        assert_eq!(math_utils::normalize_heading(-90.0), 270.0);
        assert_eq!(math_utils::normalize_heading(450.0), 90.0);
    }
}
