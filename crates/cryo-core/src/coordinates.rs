//! Spherical/Cartesian conversion for magnetic field vectors.
//!
//! Spherical triples are `[magnitude, azimuthal, polar]` in degrees, with the
//! azimuthal angle measured from +z and the polar angle measured in the xy
//! plane from +x. A negative magnitude is allowed and flips the vector.

/// Default tolerance below which a component is treated as zero.
pub const DEFAULT_TOLERANCE: f64 = 1e-10;

/// Converts `[magnitude, azimuthal, polar]` (degrees) to `[x, y, z]`.
pub fn spherical_to_cartesian(spherical: [f64; 3]) -> [f64; 3] {
    let [magnitude, azimuthal, polar] = spherical;
    let (theta, phi) = (azimuthal.to_radians(), polar.to_radians());
    [
        magnitude * theta.sin() * phi.cos(),
        magnitude * theta.sin() * phi.sin(),
        magnitude * theta.cos(),
    ]
}

/// Converts `[x, y, z]` to `[magnitude, azimuthal, polar]` (degrees).
///
/// With `negate_magnitude` the result uses the opposite-pointing angles and a
/// negative magnitude, which describes the same vector. Vectors shorter than
/// `tolerance` map to all zeros. On the z axis the polar angle is 0 and the
/// azimuthal angle is 0 or 180 depending on the sign of z.
pub fn cartesian_to_spherical(cartesian: [f64; 3], negate_magnitude: bool, tolerance: f64) -> [f64; 3] {
    let [x, y, z] = cartesian;
    let magnitude = (x * x + y * y + z * z).sqrt();
    if magnitude < tolerance {
        return [0.0, 0.0, 0.0];
    }

    let projection = (x * x + y * y).sqrt();
    let (azimuthal, polar) = if projection < tolerance {
        (if z < 0.0 { 180.0 } else { 0.0 }, 0.0)
    } else if z.abs() < tolerance {
        (90.0, y.atan2(x).to_degrees())
    } else {
        ((z / magnitude).clamp(-1.0, 1.0).acos().to_degrees(), y.atan2(x).to_degrees())
    };

    if negate_magnitude {
        [-magnitude, 180.0 + azimuthal, polar]
    } else {
        [magnitude, azimuthal, polar]
    }
}

/// Component-wise comparison within `tolerance`.
pub fn equal_enough(a: [f64; 3], b: [f64; 3], tolerance: f64) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= tolerance)
}

/// Rounds each component to five decimals, removing conversion noise.
pub fn clean(v: [f64; 3]) -> [f64; 3] {
    v.map(|c| {
        let r = (c * 1e5).round() / 1e5;
        if r == 0.0 {
            0.0
        } else {
            r
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: [f64; 3], negate: bool) -> [f64; 3] {
        spherical_to_cartesian(cartesian_to_spherical(v, negate, DEFAULT_TOLERANCE))
    }

    #[test]
    fn test_round_trip_all_octants() {
        for &x in &[-1.5f64, -0.2, 0.0, 0.3, 2.0] {
            for &y in &[-0.7, 0.0, 0.4] {
                for &z in &[-1.0, 0.0, 0.05, 1.2] {
                    let v = [x, y, z];
                    if (x * x + y * y + z * z).sqrt() < 1e-9 {
                        continue;
                    }
                    for negate in [false, true] {
                        assert!(
                            equal_enough(round_trip(v, negate), v, 1e-5),
                            "round trip failed for {:?} (negate={})",
                            v,
                            negate
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_poles() {
        assert_eq!(cartesian_to_spherical([0.0, 0.0, 2.0], false, DEFAULT_TOLERANCE), [2.0, 0.0, 0.0]);
        assert_eq!(cartesian_to_spherical([0.0, 0.0, -2.0], false, DEFAULT_TOLERANCE), [2.0, 180.0, 0.0]);
        assert!(equal_enough(round_trip([0.0, 0.0, -2.0], true), [0.0, 0.0, -2.0], 1e-9));
    }

    #[test]
    fn test_zero_vector() {
        assert_eq!(cartesian_to_spherical([0.0, 1e-12, 0.0], true, DEFAULT_TOLERANCE), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_equator() {
        let s = cartesian_to_spherical([0.0, -1.0, 0.0], false, DEFAULT_TOLERANCE);
        assert!(equal_enough(s, [1.0, 90.0, -90.0], 1e-9));
    }

    #[test]
    fn test_clean() {
        assert_eq!(clean([1.0000000001, -0.0000000001, 0.123456789]), [1.0, 0.0, 0.12346]);
    }
}
