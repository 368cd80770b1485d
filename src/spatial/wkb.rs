use std::io::Cursor;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CoreError, CoreResult};
use crate::spatial::Geometry;

const WKB_POINT: u32 = 1;
const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOLYGON: u32 = 6;
/// EWKB flag marking an embedded SRID.
const EWKB_SRID_FLAG: u32 = 0x2000_0000;

/// Encodes to little-endian EWKB. The SRID rides on the top-level geometry;
/// member polygons of a MultiPolygon are written as plain WKB.
pub fn geometry_to_wkb(geometry: &Geometry) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    write_geometry(&mut out, geometry, true)
        .map_err(|err| CoreError::integrity(format!("wkb encode failed: {err}")))?;
    Ok(out)
}

fn write_geometry(out: &mut Vec<u8>, geometry: &Geometry, with_srid: bool) -> std::io::Result<()> {
    out.write_u8(1)?; // little endian
    let type_code = match geometry {
        Geometry::Point { .. } => WKB_POINT,
        Geometry::Polygon { .. } => WKB_POLYGON,
        Geometry::MultiPolygon { .. } => WKB_MULTIPOLYGON,
    };
    if with_srid {
        out.write_u32::<LittleEndian>(type_code | EWKB_SRID_FLAG)?;
        out.write_u32::<LittleEndian>(geometry.srid() as u32)?;
    } else {
        out.write_u32::<LittleEndian>(type_code)?;
    }

    match geometry {
        Geometry::Point { coordinates, .. } => {
            out.write_f64::<LittleEndian>(coordinates[0])?;
            out.write_f64::<LittleEndian>(coordinates[1])?;
        }
        Geometry::Polygon { coordinates, .. } => write_rings(out, coordinates)?,
        Geometry::MultiPolygon { coordinates, srid } => {
            out.write_u32::<LittleEndian>(coordinates.len() as u32)?;
            for polygon in coordinates {
                let member = Geometry::Polygon {
                    coordinates: polygon.clone(),
                    srid: *srid,
                };
                write_geometry(out, &member, false)?;
            }
        }
    }
    Ok(())
}

fn write_rings(out: &mut Vec<u8>, rings: &[Vec<[f64; 2]>]) -> std::io::Result<()> {
    out.write_u32::<LittleEndian>(rings.len() as u32)?;
    for ring in rings {
        out.write_u32::<LittleEndian>(ring.len() as u32)?;
        for point in ring {
            out.write_f64::<LittleEndian>(point[0])?;
            out.write_f64::<LittleEndian>(point[1])?;
        }
    }
    Ok(())
}

/// Decodes WKB or EWKB, either byte order. Unknown type codes and truncated
/// buffers surface as `Integrity`: stored geometry is never user input.
pub fn wkb_to_geometry(bytes: &[u8]) -> CoreResult<Geometry> {
    let mut cursor = Cursor::new(bytes);
    let (geometry, _) = read_geometry(&mut cursor, None)
        .map_err(|err| CoreError::integrity(format!("wkb decode failed: {err}")))?;
    Ok(geometry)
}

type IoResult<T> = std::io::Result<T>;

fn bad_data(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

/// Reads one geometry. `inherited_srid` carries the container's SRID into
/// members that do not repeat it. Returns the geometry and its SRID.
fn read_geometry(
    cursor: &mut Cursor<&[u8]>,
    inherited_srid: Option<i32>,
) -> IoResult<(Geometry, i32)> {
    let little_endian = match cursor.read_u8()? {
        0 => false,
        1 => true,
        other => return Err(bad_data(format!("bad byte-order marker {other}"))),
    };

    let raw_type = read_u32(cursor, little_endian)?;
    let srid = if raw_type & EWKB_SRID_FLAG != 0 {
        read_u32(cursor, little_endian)? as i32
    } else {
        inherited_srid.unwrap_or(crate::spatial::DEFAULT_SRID)
    };

    let geometry = match raw_type & !EWKB_SRID_FLAG {
        WKB_POINT => Geometry::Point {
            coordinates: read_point(cursor, little_endian)?,
            srid,
        },
        WKB_POLYGON => Geometry::Polygon {
            coordinates: read_rings(cursor, little_endian)?,
            srid,
        },
        WKB_MULTIPOLYGON => {
            let count = read_u32(cursor, little_endian)? as usize;
            let mut polygons = Vec::with_capacity(count);
            for _ in 0..count {
                let (member, _) = read_geometry(cursor, Some(srid))?;
                match member {
                    Geometry::Polygon { coordinates, .. } => polygons.push(coordinates),
                    other => {
                        return Err(bad_data(format!(
                            "MultiPolygon member is a {}",
                            other.kind()
                        )))
                    }
                }
            }
            Geometry::MultiPolygon {
                coordinates: polygons,
                srid,
            }
        }
        other => return Err(bad_data(format!("unsupported wkb type {other}"))),
    };
    Ok((geometry, srid))
}

fn read_u32(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> IoResult<u32> {
    if little_endian {
        cursor.read_u32::<LittleEndian>()
    } else {
        cursor.read_u32::<BigEndian>()
    }
}

fn read_f64(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> IoResult<f64> {
    if little_endian {
        cursor.read_f64::<LittleEndian>()
    } else {
        cursor.read_f64::<BigEndian>()
    }
}

fn read_point(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> IoResult<[f64; 2]> {
    Ok([
        read_f64(cursor, little_endian)?,
        read_f64(cursor, little_endian)?,
    ])
}

fn read_rings(cursor: &mut Cursor<&[u8]>, little_endian: bool) -> IoResult<Vec<Vec<[f64; 2]>>> {
    let ring_count = read_u32(cursor, little_endian)? as usize;
    let mut rings = Vec::with_capacity(ring_count);
    for _ in 0..ring_count {
        let point_count = read_u32(cursor, little_endian)? as usize;
        let mut ring = Vec::with_capacity(point_count);
        for _ in 0..point_count {
            ring.push(read_point(cursor, little_endian)?);
        }
        rings.push(ring);
    }
    Ok(rings)
}
