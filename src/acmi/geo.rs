//! # 測地座標変換
//!
//! ローカル直交座標（ENU, m）と測地座標（緯度・経度・高度）の相互変換を提供します。
//!
//! 平面地球近似を採用しており、基準点から約100km以内の領域を想定しています。
//! 経度方向の縮尺は基準点の緯度で評価した定数であり、逆変換も同じ縮尺を使うため
//! 反復計算なしで厳密な逆関数になります。基準点から離れるほど精度は落ちますが、
//! すべての入力に対して値は定義されます。

use serde::{Deserialize, Serialize};

use crate::models::common::{math_utils, Position3D, Velocity3D};

/// 緯度1度あたりのメートル数
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// 極付近で cos(lat0) が0になるのを防ぐ下限
const MIN_COS_LAT: f64 = 1e-9;

/// 測地座標（度、度、m）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// 基準点が指定されない場合のデフォルト（Edwards AFB, CA）
pub const EDWARDS_AFB: GeoPoint = GeoPoint { lat: 34.9054, lon: -117.8839, alt: 700.0 };

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64, alt: f64) -> Self {
        Self { lat, lon, alt }
    }

    /// 座標が一般的な範囲内かどうか（警告用、変換は拒否しない）
    pub fn is_plausible(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
            && (-1_000.0..=100_000.0).contains(&self.alt)
    }
}

fn lon_meters_per_degree(reference: GeoPoint) -> f64 {
    let cos_lat = math_utils::deg_to_rad(reference.lat).cos();
    let cos_lat = if cos_lat.abs() < MIN_COS_LAT {
        MIN_COS_LAT.copysign(cos_lat)
    } else {
        cos_lat
    };
    METERS_PER_DEGREE * cos_lat
}

/// ローカル直交座標 → 測地座標
///
/// # 引数
///
/// * `offset` - 基準点からのENUオフセット（m）
/// * `reference` - 基準点
pub fn to_geodetic(offset: Position3D, reference: GeoPoint) -> GeoPoint {
    GeoPoint {
        lat: reference.lat + offset.y / METERS_PER_DEGREE,
        lon: reference.lon + offset.x / lon_meters_per_degree(reference),
        alt: reference.alt + offset.z,
    }
}

/// 測地座標 → ローカル直交座標（`to_geodetic` の逆変換）
pub fn to_cartesian(point: GeoPoint, reference: GeoPoint) -> Position3D {
    Position3D {
        x: (point.lon - reference.lon) * lon_meters_per_degree(reference),
        y: (point.lat - reference.lat) * METERS_PER_DEGREE,
        z: point.alt - reference.alt,
    }
}

/// 対気速度と姿勢から速度ベクトルを推定（無風を仮定）
///
/// CAM速度を持たないACMIの取り込み時に使用します。
///
/// # 引数
///
/// * `airspeed` - 対気速度（m/s）
/// * `pitch` - ピッチ角（度、機首上げが正）
/// * `yaw` - ヨー角（度、0=北, 90=東）
pub fn velocity_from_airspeed(airspeed: f64, pitch: f64, yaw: f64) -> Velocity3D {
    let pitch_rad = math_utils::deg_to_rad(pitch);
    let yaw_rad = math_utils::deg_to_rad(yaw);

    let horizontal = airspeed * pitch_rad.cos();
    Velocity3D::new(
        horizontal * yaw_rad.sin(),
        horizontal * yaw_rad.cos(),
        airspeed * pitch_rad.sin(),
    )
}
